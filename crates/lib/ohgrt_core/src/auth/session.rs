//! Session issuance, refresh-token rotation and logout.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::directory::{RefreshTokenStore, UserDirectory};
use super::token::TokenCodec;
use super::{AuthError, AuthRejection};
use crate::models::auth::{RefreshTokenRecord, TokenPair, User};

pub struct SessionService {
    codec: Arc<TokenCodec>,
    users: Arc<dyn UserDirectory>,
    tokens: Arc<dyn RefreshTokenStore>,
}

impl SessionService {
    pub fn new(
        codec: Arc<TokenCodec>,
        users: Arc<dyn UserDirectory>,
        tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        Self {
            codec,
            users,
            tokens,
        }
    }

    /// Mint an access/refresh pair for an already-verified user.
    pub async fn issue(
        &self,
        user: &User,
        device_info: Option<&str>,
    ) -> Result<TokenPair, AuthError> {
        let (pair, record) = self.mint(user, device_info)?;
        self.tokens.insert(record).await?;
        Ok(pair)
    }

    fn mint(
        &self,
        user: &User,
        device_info: Option<&str>,
    ) -> Result<(TokenPair, RefreshTokenRecord), AuthError> {
        let access_token = self.codec.create_access_token(&user.id, &user.email)?;
        let refresh = self.codec.create_refresh_token();
        let record = RefreshTokenRecord {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: user.id.clone(),
            token_hash: refresh.hash,
            device_info: device_info.map(str::to_string),
            created_at: Utc::now(),
            expires_at: refresh.expires_at,
            revoked_at: None,
        };
        let pair = TokenPair {
            access_token,
            refresh_token: refresh.raw,
            expires_in: self.codec.access_ttl_secs(),
        };
        Ok((pair, record))
    }

    /// Exchange a refresh token for a new pair. The presented token is
    /// revoked; of concurrent calls with the same token at most one succeeds.
    pub async fn refresh(&self, raw: &str) -> Result<TokenPair, AuthError> {
        let hash = TokenCodec::hash_refresh_token(raw);
        let Some(record) = self.tokens.find_by_hash(&hash).await? else {
            return Err(invalid_refresh("unknown"));
        };
        if !record.is_usable_at(Utc::now()) {
            return Err(invalid_refresh(if record.revoked_at.is_some() {
                "revoked"
            } else {
                "expired"
            }));
        }

        let user = match self.users.find_user_by_id(&record.user_id).await? {
            Some(user) if user.is_active => user,
            Some(_) => return Err(invalid_refresh("user_inactive")),
            None => return Err(invalid_refresh("user_not_found")),
        };

        let (pair, replacement) = self.mint(&user, record.device_info.as_deref())?;
        if !self.tokens.rotate(&record, replacement).await? {
            return Err(invalid_refresh("already_rotated"));
        }
        info!(user_id = %user.id, "Refresh token rotated");
        Ok(pair)
    }

    /// Revoke the session behind a refresh token. Returns whether one was revoked.
    pub async fn logout(&self, raw: &str) -> Result<bool, AuthError> {
        let hash = TokenCodec::hash_refresh_token(raw);
        let Some(record) = self.tokens.find_by_hash(&hash).await? else {
            return Ok(false);
        };
        let revoked = self.tokens.revoke(&record.id).await?;
        if revoked {
            info!(user_id = %record.user_id, "Session logged out");
        }
        Ok(revoked)
    }

    /// Revoke every session of a user.
    pub async fn logout_all(&self, user_id: &str) -> Result<u64, AuthError> {
        let revoked = self.tokens.revoke_all_for_user(user_id).await?;
        info!(user_id, revoked, "All sessions logged out");
        Ok(revoked)
    }

    /// Drop refresh tokens past their expiry.
    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        self.tokens.purge_expired(Utc::now()).await
    }
}

fn invalid_refresh(detail: &'static str) -> AuthError {
    warn!(
        reason = AuthRejection::InvalidRefreshToken.code(),
        detail, "auth_rejected"
    );
    AuthError::Rejected(AuthRejection::InvalidRefreshToken)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{MemoryRefreshTokenStore, MemoryUserDirectory};
    use crate::settings::JwtSettings;

    struct Fixture {
        sessions: Arc<SessionService>,
        codec: Arc<TokenCodec>,
        users: Arc<MemoryUserDirectory>,
        tokens: Arc<MemoryRefreshTokenStore>,
        user: User,
    }

    fn fixture() -> Fixture {
        let codec = Arc::new(TokenCodec::new(&JwtSettings::with_secret("session-test")));
        let users = Arc::new(MemoryUserDirectory::new());
        let tokens = Arc::new(MemoryRefreshTokenStore::new());
        let user = User {
            id: "u1".into(),
            email: "a@example.com".into(),
            is_active: true,
        };
        users.upsert(user.clone());
        let sessions = Arc::new(SessionService::new(
            codec.clone(),
            users.clone(),
            tokens.clone(),
        ));
        Fixture {
            sessions,
            codec,
            users,
            tokens,
            user,
        }
    }

    fn is_invalid_refresh(result: &Result<TokenPair, AuthError>) -> bool {
        matches!(
            result,
            Err(AuthError::Rejected(AuthRejection::InvalidRefreshToken))
        )
    }

    #[tokio::test]
    async fn issue_stores_only_the_hash() {
        let f = fixture();
        let pair = f.sessions.issue(&f.user, Some("cli")).await.unwrap();
        assert_eq!(pair.expires_in, 900);
        assert!(f.codec.decode_access_token(&pair.access_token).is_some());
        let stored = f
            .tokens
            .find_by_hash(&TokenCodec::hash_refresh_token(&pair.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stored.token_hash, pair.refresh_token);
        assert_eq!(stored.device_info.as_deref(), Some("cli"));
    }

    #[tokio::test]
    async fn refresh_rotates_and_old_token_dies() {
        let f = fixture();
        let first = f.sessions.issue(&f.user, None).await.unwrap();
        let second = f.sessions.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(first.refresh_token, second.refresh_token);
        assert!(is_invalid_refresh(
            &f.sessions.refresh(&first.refresh_token).await
        ));
        assert!(f.sessions.refresh(&second.refresh_token).await.is_ok());
    }

    #[tokio::test]
    async fn unknown_refresh_token_is_rejected() {
        let f = fixture();
        assert!(is_invalid_refresh(&f.sessions.refresh("nope").await));
    }

    #[tokio::test]
    async fn inactive_user_cannot_refresh() {
        let f = fixture();
        let pair = f.sessions.issue(&f.user, None).await.unwrap();
        f.users.set_active("u1", false);
        assert!(is_invalid_refresh(
            &f.sessions.refresh(&pair.refresh_token).await
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_refresh_has_one_winner() {
        let f = fixture();
        let pair = f.sessions.issue(&f.user, None).await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let sessions = f.sessions.clone();
            let raw = pair.refresh_token.clone();
            handles.push(tokio::spawn(async move { sessions.refresh(&raw).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    /// Token store whose next rotation fails before anything is written.
    struct StalledRotation {
        inner: MemoryRefreshTokenStore,
        fail_next: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl RefreshTokenStore for StalledRotation {
        async fn find_by_hash(
            &self,
            token_hash: &str,
        ) -> Result<Option<RefreshTokenRecord>, AuthError> {
            self.inner.find_by_hash(token_hash).await
        }

        async fn insert(&self, record: RefreshTokenRecord) -> Result<(), AuthError> {
            self.inner.insert(record).await
        }

        async fn revoke(&self, token_id: &str) -> Result<bool, AuthError> {
            self.inner.revoke(token_id).await
        }

        async fn rotate(
            &self,
            old: &RefreshTokenRecord,
            replacement: RefreshTokenRecord,
        ) -> Result<bool, AuthError> {
            if self
                .fail_next
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                return Err(AuthError::Internal("db down".into()));
            }
            self.inner.rotate(old, replacement).await
        }

        async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, AuthError> {
            self.inner.revoke_all_for_user(user_id).await
        }

        async fn purge_expired(&self, now: chrono::DateTime<Utc>) -> Result<u64, AuthError> {
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn failed_rotation_keeps_the_session() {
        let f = fixture();
        let tokens = Arc::new(StalledRotation {
            inner: MemoryRefreshTokenStore::new(),
            fail_next: std::sync::atomic::AtomicBool::new(false),
        });
        let sessions = SessionService::new(f.codec.clone(), f.users.clone(), tokens.clone());
        let pair = sessions.issue(&f.user, None).await.unwrap();

        tokens
            .fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(matches!(
            sessions.refresh(&pair.refresh_token).await,
            Err(AuthError::Internal(_))
        ));

        // The presented token survives the failed attempt.
        let retried = sessions.refresh(&pair.refresh_token).await.unwrap();
        assert_ne!(retried.refresh_token, pair.refresh_token);
        assert_eq!(tokens.inner.len(), 2);
    }

    #[tokio::test]
    async fn logout_revokes_once() {
        let f = fixture();
        let pair = f.sessions.issue(&f.user, None).await.unwrap();
        assert!(f.sessions.logout(&pair.refresh_token).await.unwrap());
        assert!(!f.sessions.logout(&pair.refresh_token).await.unwrap());
        assert!(!f.sessions.logout("unknown").await.unwrap());
        assert!(is_invalid_refresh(
            &f.sessions.refresh(&pair.refresh_token).await
        ));
    }

    #[tokio::test]
    async fn logout_all_revokes_every_session() {
        let f = fixture();
        let a = f.sessions.issue(&f.user, None).await.unwrap();
        let b = f.sessions.issue(&f.user, None).await.unwrap();
        assert_eq!(f.sessions.logout_all("u1").await.unwrap(), 2);
        assert!(is_invalid_refresh(&f.sessions.refresh(&a.refresh_token).await));
        assert!(is_invalid_refresh(&f.sessions.refresh(&b.refresh_token).await));
    }
}
