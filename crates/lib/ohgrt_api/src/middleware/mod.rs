//! Request middleware, outermost first: correlation id, security gate,
//! rate limit, then per-route authentication.

pub mod auth;
pub mod correlation;
pub mod rate_limit;
pub mod security;

use axum::http::HeaderName;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub const X_CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");
pub const X_NONCE: HeaderName = HeaderName::from_static("x-nonce");
pub const X_TIMESTAMP: HeaderName = HeaderName::from_static("x-timestamp");
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
