//! Rate-limit middleware.
//!
//! Authenticated callers are counted by user id taken from a valid bearer
//! token; everyone else by client address.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use ohgrt_core::auth::bearer_credential;
use ohgrt_core::ratelimit::{ClientIdentity, RateLimitOutcome};

use super::{
    X_FORWARDED_FOR, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, X_REAL_IP,
};
use crate::AppState;
use crate::error::AppError;

fn client_identity(state: &AppState, headers: &HeaderMap, peer: Option<String>) -> ClientIdentity {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(claims) = header(AUTHORIZATION)
        .and_then(bearer_credential)
        .and_then(|token| state.security.codec.decode_access_token(token))
    {
        return ClientIdentity::User(claims.sub);
    }
    ClientIdentity::from_address(header(X_FORWARDED_FOR), header(X_REAL_IP), peer.as_deref())
}

/// Axum middleware: counts the request against the client's minute and hour
/// windows and sets `X-RateLimit-*` headers on admitted responses.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let settings = &state.security.settings.rate_limit;
    if !settings.enabled
        || request.method() == Method::OPTIONS
        || settings.exempt.matches(request.uri().path())
    {
        return Ok(next.run(request).await);
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());
    let client = client_identity(&state, request.headers(), peer);

    match state.security.limiter.check(&client).await {
        RateLimitOutcome::Limited {
            window,
            retry_after_secs,
        } => Err(AppError::RateLimited {
            retry_after: retry_after_secs,
            message: window.client_message(),
        }),
        RateLimitOutcome::Allowed {
            limit,
            remaining,
            reset_at,
        } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(remaining));
            headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_at));
            Ok(response)
        }
    }
}
