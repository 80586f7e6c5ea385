//! Identity probe for clients holding an optional credential.

use axum::{Extension, Json};

use crate::middleware::auth::AuthenticatedUser;
use crate::models::{UserResponse, WhoAmIResponse};

/// `GET /api/whoami`: anonymous callers get `authenticated: false`.
pub async fn whoami_handler(
    user: Option<Extension<AuthenticatedUser>>,
) -> Json<WhoAmIResponse> {
    let user: Option<UserResponse> = user.map(|Extension(AuthenticatedUser(user))| user.into());
    Json(WhoAmIResponse {
        authenticated: user.is_some(),
        user,
    })
}
