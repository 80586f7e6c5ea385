//! Access and refresh token handling.
//!
//! Access tokens are HMAC-signed JWTs carrying `sub`, `email`, `iat`, `exp`
//! and `type = "access"`. Refresh tokens are opaque random strings; only
//! their SHA-256 hex digest is persisted.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::AuthError;
use crate::settings::JwtSettings;

const ACCESS_TOKEN_TYPE: &str = "access";

/// Random bytes per refresh token (256 bits).
const REFRESH_TOKEN_BYTES: usize = 32;

/// JWT claims embedded in access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Subject: user ID.
    pub sub: String,
    pub email: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiry (unix timestamp).
    pub exp: i64,
    #[serde(rename = "type")]
    pub kind: String,
}

/// A freshly minted refresh token. `raw` goes to the client, `hash` to storage.
#[derive(Clone)]
pub struct IssuedRefreshToken {
    pub raw: String,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedRefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedRefreshToken")
            .field("raw", &"<redacted>")
            .field("hash", &self.hash)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Why a token failed to decode. Only ever logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeFailure {
    Expired,
    BadSignature,
    Malformed,
    WrongType,
}

impl DecodeFailure {
    fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::Malformed => "malformed",
            Self::WrongType => "wrong_type",
        }
    }
}

/// Encodes and verifies tokens with one signing key.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenCodec {
    pub fn new(settings: &JwtSettings) -> Self {
        Self {
            encoding: EncodingKey::from_secret(settings.secret.as_bytes()),
            decoding: DecodingKey::from_secret(settings.secret.as_bytes()),
            algorithm: settings.algorithm,
            access_ttl: settings.access_ttl,
            refresh_ttl: settings.refresh_ttl,
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl.num_seconds()
    }

    /// Sign an access token for `user_id`.
    pub fn create_access_token(&self, user_id: &str, email: &str) -> Result<String, AuthError> {
        self.create_access_token_at(user_id, email, Utc::now())
    }

    fn create_access_token_at(
        &self,
        user_id: &str,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let claims = AccessClaims {
            sub: user_id.to_string(),
            email: email.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            kind: ACCESS_TOKEN_TYPE.to_string(),
        };
        encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| AuthError::TokenError(format!("jwt encode: {e}")))
    }

    /// Verify an access token. Every failure collapses to `None`.
    pub fn decode_access_token(&self, token: &str) -> Option<AccessClaims> {
        match self.try_decode(token) {
            Ok(claims) => Some(claims),
            Err(failure) => {
                debug!(reason = failure.as_str(), "Access token rejected");
                None
            }
        }
    }

    fn try_decode(&self, token: &str) -> Result<AccessClaims, DecodeFailure> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let claims = decode::<AccessClaims>(token, &self.decoding, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => DecodeFailure::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    DecodeFailure::BadSignature
                }
                _ => DecodeFailure::Malformed,
            })?
            .claims;

        if claims.kind != ACCESS_TOKEN_TYPE {
            return Err(DecodeFailure::WrongType);
        }
        Ok(claims)
    }

    /// Mint a refresh token with 256 bits of entropy.
    pub fn create_refresh_token(&self) -> IssuedRefreshToken {
        let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let raw = URL_SAFE_NO_PAD.encode(bytes);
        let hash = Self::hash_refresh_token(&raw);
        IssuedRefreshToken {
            raw,
            hash,
            expires_at: Utc::now() + self.refresh_ttl,
        }
    }

    /// SHA-256 hex digest of a raw refresh token.
    pub fn hash_refresh_token(raw: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(&JwtSettings::with_secret("test-secret-for-token-codec"))
    }

    #[test]
    fn access_token_roundtrip() {
        let codec = codec();
        let token = codec.create_access_token("user-1", "a@example.com").unwrap();
        let claims = codec.decode_access_token(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email, "a@example.com");
        assert_eq!(claims.kind, "access");
        assert_eq!(claims.exp - claims.iat, 15 * 60);
    }

    #[test]
    fn expired_token_is_rejected() {
        let codec = codec();
        let token = codec
            .create_access_token_at("user-1", "a@example.com", Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(codec.try_decode(&token), Err(DecodeFailure::Expired));
        assert!(codec.decode_access_token(&token).is_none());
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let other = TokenCodec::new(&JwtSettings::with_secret("some-other-secret"));
        let token = other.create_access_token("user-1", "a@example.com").unwrap();
        assert_eq!(codec().try_decode(&token), Err(DecodeFailure::BadSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(codec().try_decode("not.a.jwt"), Err(DecodeFailure::Malformed));
        assert!(codec().decode_access_token("").is_none());
    }

    #[test]
    fn non_access_token_type_is_rejected() {
        let codec = codec();
        let now = Utc::now();
        let claims = AccessClaims {
            sub: "user-1".into(),
            email: "a@example.com".into(),
            iat: now.timestamp(),
            exp: (now + Duration::minutes(5)).timestamp(),
            kind: "refresh".into(),
        };
        let token = encode(&Header::default(), &claims, &codec.encoding).unwrap();
        assert_eq!(codec.try_decode(&token), Err(DecodeFailure::WrongType));
    }

    #[test]
    fn refresh_tokens_are_unique_and_hash_deterministically() {
        let codec = codec();
        let a = codec.create_refresh_token();
        let b = codec.create_refresh_token();
        assert_ne!(a.raw, b.raw);
        assert_eq!(a.raw.len(), 43);
        assert_eq!(a.hash, TokenCodec::hash_refresh_token(&a.raw));
        assert_eq!(a.hash.len(), 64);
        assert!(a.expires_at > Utc::now() + Duration::days(6));
    }

    #[test]
    fn debug_output_redacts_raw_refresh_token() {
        let issued = codec().create_refresh_token();
        assert!(!format!("{issued:?}").contains(&issued.raw));
    }
}
