//! Application error types.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use ohgrt_core::auth::AuthError;
use ohgrt_core::gate::GateError;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Convenience alias for handler return types.
pub type AppResult<T> = Result<T, AppError>;

/// Uniform client message for every authentication failure.
const UNAUTHORIZED_MESSAGE: &str = "Could not validate credentials";

/// Error body returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Application-level errors with HTTP status mapping.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Option<serde_json::Value>,
    },

    /// The reason code is logged, never sent.
    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("Rate limited: {message}")]
    RateLimited {
        retry_after: u64,
        message: &'static str,
    },

    #[error("Replay detected: {0}")]
    ReplayDetected(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal server error")]
    Internal(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = ErrorResponse {
            error: String::new(),
            message: String::new(),
            details: None,
            retry_after: None,
        };
        let status = match self {
            AppError::Validation { message, details } => {
                body.error = "validation_error".into();
                body.message = message;
                body.details = details;
                StatusCode::BAD_REQUEST
            }
            AppError::Unauthorized(_) => {
                body.error = "unauthorized".into();
                body.message = UNAUTHORIZED_MESSAGE.into();
                StatusCode::UNAUTHORIZED
            }
            AppError::RateLimited {
                retry_after,
                message,
            } => {
                body.error = "rate_limit_exceeded".into();
                body.message = message.into();
                body.retry_after = Some(retry_after);
                StatusCode::TOO_MANY_REQUESTS
            }
            AppError::ReplayDetected(message) => {
                body.error = "replay_detected".into();
                body.message = message;
                StatusCode::BAD_REQUEST
            }
            AppError::ServiceUnavailable(message) => {
                body.error = "service_unavailable".into();
                body.message = message;
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::NotFound(message) => {
                body.error = "not_found".into();
                body.message = message;
                StatusCode::NOT_FOUND
            }
            AppError::Internal(detail) => {
                error!("Internal error: {detail}");
                body.error = "internal_error".into();
                body.message = "Internal server error".into();
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let retry_after = body.retry_after;
        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        if status == StatusCode::UNAUTHORIZED {
            headers.insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        if let Some(secs) = retry_after {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("row not found".into()),
            _ => AppError::Internal(e.to_string()),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Rejected(reason) => AppError::Unauthorized(reason.code()),
            AuthError::TokenError(msg) => AppError::Internal(msg),
            AuthError::DbError(e) => AppError::from(e),
            AuthError::Internal(msg) => AppError::Internal(msg),
        }
    }
}

impl From<GateError> for AppError {
    fn from(e: GateError) -> Self {
        let message = e.to_string();
        match e {
            GateError::MissingHeaders(missing) => AppError::Validation {
                message,
                details: Some(serde_json::json!({ "missing_headers": missing })),
            },
            GateError::InvalidTimestamp | GateError::StaleTimestamp { .. } => {
                AppError::validation(message)
            }
            GateError::NonceReused => AppError::ReplayDetected(message),
            GateError::Unavailable(_) => AppError::ServiceUnavailable(message),
        }
    }
}
