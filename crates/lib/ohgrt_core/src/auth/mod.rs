//! Authentication: token encoding, credential checks and session rotation.
//!
//! Shared between the HTTP middleware in `ohgrt_api` and anything else that
//! needs to turn a bearer credential into a [`crate::models::auth::User`].

pub mod authenticator;
pub mod directory;
pub mod queries;
pub mod session;
pub mod token;

use thiserror::Error;

pub use authenticator::{AuthMode, AuthOutcome, RequestAuthenticator, bearer_credential};
pub use directory::{
    MemoryRefreshTokenStore, MemoryUserDirectory, RefreshTokenStore, UserDirectory,
};
pub use queries::{PgRefreshTokenStore, PgUserDirectory};
pub use session::SessionService;
pub use token::{AccessClaims, IssuedRefreshToken, TokenCodec};

/// Why a credential was refused. Logged, never shown to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRejection {
    MissingToken,
    InvalidOrExpired,
    UserNotFound,
    UserInactive,
    InvalidRefreshToken,
}

impl AuthRejection {
    pub fn code(self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidOrExpired => "invalid_or_expired",
            Self::UserNotFound => "user_not_found",
            Self::UserInactive => "user_inactive",
            Self::InvalidRefreshToken => "invalid_refresh_token",
        }
    }
}

/// Authentication errors.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unauthorized: {}", .0.code())]
    Rejected(AuthRejection),

    #[error("Token error: {0}")]
    TokenError(String),

    #[error("Database error: {0}")]
    DbError(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AuthRejection> for AuthError {
    fn from(reason: AuthRejection) -> Self {
        Self::Rejected(reason)
    }
}
