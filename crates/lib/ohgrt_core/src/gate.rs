//! Per-request verification: required headers, timestamp freshness and
//! nonce consumption.
//!
//! The gate is transport-agnostic. The HTTP layer copies the relevant request
//! parts into a [`GateRequest`] and maps [`GateError`] to a response.

use thiserror::Error;
use tracing::{debug, warn};

use crate::nonce::NonceGuard;
use crate::settings::{Environment, GateSettings};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
pub const NONCE_HEADER: &str = "X-Nonce";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// What the gate needs to know about a request.
#[derive(Debug, Clone, Default)]
pub struct GateRequest<'a> {
    pub is_preflight: bool,
    pub path: &'a str,
    pub request_id: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub timestamp: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bypass {
    LiteMode,
    Exempt,
    Preflight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Bypassed(Bypass),
    Verified { request_id: String },
}

/// Request verification failures.
#[derive(Debug, Error, PartialEq)]
pub enum GateError {
    #[error("Missing required security headers: {}", .0.join(", "))]
    MissingHeaders(Vec<&'static str>),

    #[error("Invalid timestamp format. Expected Unix timestamp.")]
    InvalidTimestamp,

    #[error("Request timestamp expired or too far in future")]
    StaleTimestamp { skew_secs: f64 },

    #[error("Nonce has already been used")]
    NonceReused,

    #[error("Security verification temporarily unavailable")]
    Unavailable(String),
}

pub struct SecurityGate {
    settings: GateSettings,
    environment: Environment,
    nonces: NonceGuard,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

impl SecurityGate {
    pub fn new(settings: GateSettings, environment: Environment, nonces: NonceGuard) -> Self {
        Self {
            settings,
            environment,
            nonces,
        }
    }

    pub async fn evaluate(&self, request: &GateRequest<'_>) -> Result<GateOutcome, GateError> {
        self.evaluate_at(request, crate::unix_now()).await
    }

    /// [`Self::evaluate`] against an explicit clock.
    pub async fn evaluate_at(
        &self,
        request: &GateRequest<'_>,
        now: f64,
    ) -> Result<GateOutcome, GateError> {
        if self.settings.lite_mode {
            if self.environment.is_production() {
                warn!(path = request.path, "LITE_MODE ignored in production");
            } else {
                return Ok(GateOutcome::Bypassed(Bypass::LiteMode));
            }
        }
        if self.settings.exempt.matches(request.path) {
            return Ok(GateOutcome::Bypassed(Bypass::Exempt));
        }
        if request.is_preflight {
            return Ok(GateOutcome::Bypassed(Bypass::Preflight));
        }

        let request_id = present(request.request_id);
        let nonce = present(request.nonce);
        let timestamp = present(request.timestamp);

        let (Some(request_id), Some(nonce), Some(timestamp)) = (request_id, nonce, timestamp)
        else {
            let missing: Vec<&'static str> = [
                (REQUEST_ID_HEADER, request_id.is_none()),
                (NONCE_HEADER, nonce.is_none()),
                (TIMESTAMP_HEADER, timestamp.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, absent)| absent.then_some(name))
            .collect();
            warn!(path = request.path, missing = ?missing, "security_missing_headers");
            return Err(GateError::MissingHeaders(missing));
        };

        let sent_at = match timestamp.parse::<f64>() {
            Ok(ts) if ts.is_finite() => ts,
            _ => {
                warn!(path = request.path, request_id, "security_invalid_timestamp");
                return Err(GateError::InvalidTimestamp);
            }
        };

        let skew_secs = (now - sent_at).abs();
        if skew_secs > self.settings.timestamp_tolerance_secs as f64 {
            warn!(path = request.path, request_id, skew_secs, "security_stale_timestamp");
            return Err(GateError::StaleTimestamp { skew_secs });
        }

        match self
            .nonces
            .check_and_store(nonce, self.settings.nonce_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(path = request.path, request_id, "security_nonce_reused");
                return Err(GateError::NonceReused);
            }
            Err(e) => {
                warn!(path = request.path, request_id, "Nonce check unavailable: {e}");
                return Err(GateError::Unavailable(e.to_string()));
            }
        }

        debug!(path = request.path, request_id, "Request verified");
        Ok(GateOutcome::Verified {
            request_id: request_id.to_string(),
        })
    }
}
