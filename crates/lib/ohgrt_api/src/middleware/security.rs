//! Security gate middleware: required headers, timestamp window, nonce.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use ohgrt_core::gate::{GateOutcome, GateRequest};

use super::{X_NONCE, X_REQUEST_ID, X_TIMESTAMP};
use crate::AppState;
use crate::error::AppError;

/// Axum middleware: runs the request through the security gate and echoes
/// `X-Request-ID` on verified requests.
pub async fn verify_request(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // The body is not `Sync`, so nothing borrowed from the request may be
    // held across the gate's await.
    let (request_id, nonce, timestamp) = {
        let header = |name: HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        (header(X_REQUEST_ID), header(X_NONCE), header(X_TIMESTAMP))
    };
    let path = request.uri().path().to_owned();
    let is_preflight = request.method() == Method::OPTIONS;

    let outcome = state
        .security
        .gate
        .evaluate(&GateRequest {
            is_preflight,
            path: &path,
            request_id: request_id.as_deref(),
            nonce: nonce.as_deref(),
            timestamp: timestamp.as_deref(),
        })
        .await?;

    let mut response = next.run(request).await;
    if let GateOutcome::Verified { request_id } = outcome
        && let Ok(value) = HeaderValue::from_str(&request_id)
    {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    Ok(response)
}
