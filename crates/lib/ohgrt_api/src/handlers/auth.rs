//! Session endpoints: refresh rotation, logout, current user.

use axum::extract::State;
use axum::{Extension, Json};

use crate::AppState;
use crate::error::{AppError, AppResult};
use crate::middleware::auth::AuthenticatedUser;
use crate::models::{
    LogoutAllResponse, LogoutRequest, LogoutResponse, RefreshRequest, TokenResponse, UserResponse,
};

/// `POST /auth/refresh`: exchange a refresh token for a new pair.
pub async fn refresh_handler(
    State(state): State<AppState>,
    Json(body): Json<RefreshRequest>,
) -> AppResult<Json<TokenResponse>> {
    if body.refresh_token.trim().is_empty() {
        return Err(AppError::validation("refresh_token must not be empty"));
    }
    let pair = state.security.sessions.refresh(&body.refresh_token).await?;
    Ok(Json(pair.into()))
}

/// `POST /auth/logout`: revoke the session behind a refresh token.
pub async fn logout_handler(
    State(state): State<AppState>,
    Json(body): Json<LogoutRequest>,
) -> AppResult<Json<LogoutResponse>> {
    let revoked = state.security.sessions.logout(&body.refresh_token).await?;
    Ok(Json(LogoutResponse { revoked }))
}

/// `POST /auth/logout-all`: revoke every session of the caller.
pub async fn logout_all_handler(
    State(state): State<AppState>,
    Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>,
) -> AppResult<Json<LogoutAllResponse>> {
    let revoked = state.security.sessions.logout_all(&user.id).await?;
    Ok(Json(LogoutAllResponse { revoked }))
}

/// `GET /auth/me`
pub async fn me_handler(
    Extension(AuthenticatedUser(user)): Extension<AuthenticatedUser>,
) -> Json<UserResponse> {
    Json(user.into())
}
