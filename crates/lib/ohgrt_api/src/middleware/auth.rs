//! Authentication middleware: bearer token to [`AuthenticatedUser`].

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use ohgrt_core::auth::{AuthMode, AuthOutcome, bearer_credential};
use ohgrt_core::models::auth::User;

use crate::AppState;
use crate::error::AppError;

/// Request extension set for authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

/// Axum middleware: rejects requests without a valid bearer token.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    authenticate(&state, &mut request, AuthMode::Required).await?;
    Ok(next.run(request).await)
}

/// Axum middleware: lets anonymous requests through, but still rejects a
/// present and invalid bearer token.
pub async fn optional_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    authenticate(&state, &mut request, AuthMode::Optional).await?;
    Ok(next.run(request).await)
}

async fn authenticate(
    state: &AppState,
    request: &mut Request,
    mode: AuthMode,
) -> Result<(), AppError> {
    let credential = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_credential)
        .map(str::to_owned);

    let outcome = state
        .security
        .authenticator
        .authenticate(credential.as_deref(), mode)
        .await?;
    if let AuthOutcome::Authenticated(user) = outcome {
        request.extensions_mut().insert(AuthenticatedUser(user));
    }
    Ok(())
}
