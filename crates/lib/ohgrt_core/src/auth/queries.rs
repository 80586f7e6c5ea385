//! Postgres-backed user directory and refresh-token store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::AuthError;
use super::directory::{RefreshTokenStore, UserDirectory};
use crate::models::auth::{RefreshTokenRecord, User};

type RefreshTokenRow = (
    String,
    String,
    String,
    Option<String>,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

fn record_from_row(row: RefreshTokenRow) -> RefreshTokenRecord {
    let (id, user_id, token_hash, device_info, created_at, expires_at, revoked_at) = row;
    RefreshTokenRecord {
        id,
        user_id,
        token_hash,
        device_info,
        created_at,
        expires_at,
        revoked_at,
    }
}

fn is_uuid(value: &str) -> bool {
    uuid::Uuid::parse_str(value).is_ok()
}

#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<User>, AuthError> {
        // A subject that is not a UUID cannot name a row.
        if !is_uuid(user_id) {
            return Ok(None);
        }
        let row = sqlx::query_as::<_, (String, bool)>(
            "SELECT email, is_active FROM users WHERE id = $1::uuid",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(email, is_active)| User {
            id: user_id.to_string(),
            email,
            is_active,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct PgRefreshTokenStore {
    pool: PgPool,
}

impl PgRefreshTokenStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RefreshTokenStore for PgRefreshTokenStore {
    async fn find_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, AuthError> {
        let row = sqlx::query_as::<_, RefreshTokenRow>(
            "SELECT id::text, user_id::text, token_hash, device_info, \
                    created_at, expires_at, revoked_at \
             FROM refresh_tokens \
             WHERE token_hash = $1",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(record_from_row))
    }

    async fn insert(&self, record: RefreshTokenRecord) -> Result<(), AuthError> {
        sqlx::query(
            "INSERT INTO refresh_tokens \
                (id, user_id, token_hash, device_info, created_at, expires_at) \
             VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6)",
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.token_hash)
        .bind(&record.device_info)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, token_id: &str) -> Result<bool, AuthError> {
        if !is_uuid(token_id) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = now() \
             WHERE id = $1::uuid AND revoked_at IS NULL",
        )
        .bind(token_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn rotate(
        &self,
        old: &RefreshTokenRecord,
        replacement: RefreshTokenRecord,
    ) -> Result<bool, AuthError> {
        if !is_uuid(&old.id) {
            return Ok(false);
        }
        let mut tx = self.pool.begin().await?;
        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = now() \
             WHERE id = $1::uuid AND revoked_at IS NULL",
        )
        .bind(&old.id)
        .execute(&mut *tx)
        .await?;
        if revoked.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query(
            "INSERT INTO refresh_tokens \
                (id, user_id, token_hash, device_info, created_at, expires_at) \
             VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6)",
        )
        .bind(&replacement.id)
        .bind(&replacement.user_id)
        .bind(&replacement.token_hash)
        .bind(&replacement.device_info)
        .bind(replacement.created_at)
        .bind(replacement.expires_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn revoke_all_for_user(&self, user_id: &str) -> Result<u64, AuthError> {
        if !is_uuid(user_id) {
            return Ok(0);
        }
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked_at = now() \
             WHERE user_id = $1::uuid AND revoked_at IS NULL",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AuthError> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_guard_accepts_only_uuids() {
        assert!(is_uuid("0190f1c2-3a4b-7c5d-8e6f-0123456789ab"));
        assert!(!is_uuid("user-1"));
        assert!(!is_uuid(""));
    }

    #[test]
    fn row_maps_to_record() {
        let now = Utc::now();
        let record = record_from_row((
            "id".into(),
            "user".into(),
            "hash".into(),
            None,
            now,
            now,
            None,
        ));
        assert_eq!(record.token_hash, "hash");
        assert!(record.revoked_at.is_none());
    }
}
