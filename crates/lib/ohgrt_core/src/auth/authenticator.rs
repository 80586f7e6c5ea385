//! Bearer credential to user resolution.

use std::sync::Arc;

use tracing::{debug, warn};

use super::directory::UserDirectory;
use super::token::TokenCodec;
use super::{AuthError, AuthRejection};
use crate::models::auth::User;

/// Whether a route requires a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Required,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(User),
    /// No credential on an optional route.
    Anonymous,
}

/// Extract the token from an `Authorization` header value.
///
/// The scheme match is case-insensitive. Anything but a non-empty
/// `Bearer <token>` yields `None`.
pub fn bearer_credential(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

pub struct RequestAuthenticator {
    codec: Arc<TokenCodec>,
    users: Arc<dyn UserDirectory>,
}

impl RequestAuthenticator {
    pub fn new(codec: Arc<TokenCodec>, users: Arc<dyn UserDirectory>) -> Self {
        Self { codec, users }
    }

    /// Resolve `credential` to a user.
    ///
    /// A present but invalid credential is rejected even in
    /// [`AuthMode::Optional`].
    pub async fn authenticate(
        &self,
        credential: Option<&str>,
        mode: AuthMode,
    ) -> Result<AuthOutcome, AuthError> {
        let Some(token) = credential else {
            return match mode {
                AuthMode::Required => Err(reject(AuthRejection::MissingToken, None)),
                AuthMode::Optional => Ok(AuthOutcome::Anonymous),
            };
        };

        let Some(claims) = self.codec.decode_access_token(token) else {
            return Err(reject(AuthRejection::InvalidOrExpired, None));
        };

        let Some(user) = self.users.find_user_by_id(&claims.sub).await? else {
            return Err(reject(AuthRejection::UserNotFound, Some(&claims.sub)));
        };
        if !user.is_active {
            return Err(reject(AuthRejection::UserInactive, Some(&user.id)));
        }

        debug!(user_id = %user.id, "Request authenticated");
        Ok(AuthOutcome::Authenticated(user))
    }
}

fn reject(reason: AuthRejection, user_id: Option<&str>) -> AuthError {
    warn!(reason = reason.code(), user_id, "auth_rejected");
    AuthError::Rejected(reason)
}
