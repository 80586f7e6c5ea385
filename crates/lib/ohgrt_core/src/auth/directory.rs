//! Collaborator seams: user lookup and refresh-token persistence.
//!
//! Postgres implementations live in [`super::queries`]; the in-memory ones
//! here back tests and single-process development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::AuthError;
use crate::models::auth::{RefreshTokenRecord, User};

/// Resolves the subject of an access token.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError>;
}

/// Persists refresh token hashes.
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn find_by_hash(&self, token_hash: &str)
    -> Result<Option<RefreshTokenRecord>, AuthError>;

    async fn insert(&self, record: RefreshTokenRecord) -> Result<(), AuthError>;

    /// Revoke one token. Returns `true` only if this call moved it from
    /// active to revoked.
    async fn revoke(&self, token_id: &str) -> Result<bool, AuthError>;

    /// Revoke `old` and store `replacement` as one step. Returns `false`,
    /// with nothing stored, when `old` is no longer active.
    async fn rotate(
        &self,
        old: &RefreshTokenRecord,
        replacement: RefreshTokenRecord,
    ) -> Result<bool, AuthError>;

    /// Revoke every active token of a user. Returns how many were revoked.
    async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, AuthError>;

    /// Delete tokens that expired before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError>;
}

// =============================================================================
// In-memory implementations
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: DashMap<String, User>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, user: User) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn set_active(&self, user_id: &str, is_active: bool) {
        if let Some(mut user) = self.users.get_mut(user_id) {
            user.is_active = is_active;
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        Ok(self.users.get(user_id).map(|u| u.clone()))
    }
}

/// Keyed by token hash.
#[derive(Debug, Default)]
pub struct MemoryRefreshTokenStore {
    records: DashMap<String, RefreshTokenRecord>,
}

impl MemoryRefreshTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryRefreshTokenStore {
    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, AuthError> {
        Ok(self.records.get(token_hash).map(|r| r.clone()))
    }

    async fn insert(&self, record: RefreshTokenRecord) -> Result<(), AuthError> {
        match self.records.entry(record.token_hash.clone()) {
            Entry::Occupied(_) => Err(AuthError::Internal("duplicate refresh token hash".into())),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }

    async fn revoke(&self, token_id: &str) -> Result<bool, AuthError> {
        for mut record in self.records.iter_mut() {
            if record.id == token_id {
                if record.revoked_at.is_some() {
                    return Ok(false);
                }
                record.revoked_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn rotate(
        &self,
        old: &RefreshTokenRecord,
        replacement: RefreshTokenRecord,
    ) -> Result<bool, AuthError> {
        // The replacement goes in first and is withdrawn if the revoke loses.
        // Its raw value is never handed out in that case.
        let replacement_hash = replacement.token_hash.clone();
        self.insert(replacement).await?;
        let revoked = match self.records.get_mut(&old.token_hash) {
            Some(mut current) if current.id == old.id && current.revoked_at.is_none() => {
                current.revoked_at = Some(Utc::now());
                true
            }
            _ => false,
        };
        if !revoked {
            self.records.remove(&replacement_hash);
        }
        Ok(revoked)
    }

    async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, AuthError> {
        let now = Utc::now();
        let mut revoked = 0;
        for mut record in self.records.iter_mut() {
            if record.user_id == user_id && record.revoked_at.is_none() {
                record.revoked_at = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at > now);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}
