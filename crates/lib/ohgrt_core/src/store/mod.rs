//! Shared key-value store.
//!
//! A narrow contract over string values, counters and sorted sets. The nonce
//! guard and the rate limiter only ever talk to [`KvStore`]; whether the
//! bytes land in Redis or in process memory is decided by [`SharedStore`].
//! Values are opaque strings and serialization is the caller's business.

pub mod memory;
pub mod remote;
pub mod shared;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
pub use remote::{ConnectionState, RedisStore};
pub use shared::SharedStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation `{0}` timed out")]
    Timeout(&'static str),

    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command error: {0}")]
    Command(String),

    #[error("wrong value type at key `{0}`")]
    WrongType(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the error means the backend itself is unreachable.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Timeout(_) | StoreError::Connection(_))
    }
}

/// Parameters for one sliding-window admission step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    /// Score recorded for this request (fractional Unix seconds).
    pub now: f64,
    /// Trailing window length.
    pub window: Duration,
    /// Maximum entries allowed inside the window.
    pub limit: u64,
    /// Expiry applied to the whole key after an admission.
    pub key_ttl: Duration,
}

impl WindowSpec {
    /// Entries with a score at or below this value are outside the window.
    pub fn cutoff(&self) -> f64 {
        self.now - self.window.as_secs_f64()
    }
}

/// Result of one sliding-window admission step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAdmission {
    pub admitted: bool,
    /// Entries inside the window before this request was considered.
    pub count: u64,
    /// Score of the oldest in-window entry, reported on denial.
    pub oldest: Option<f64>,
}

/// Key-value contract shared by the Redis and in-process stores.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set only when the key is absent. Returns `true` if this call wrote it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn z_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Remove members with `min <= score <= max`. Returns how many were removed.
    async fn z_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError>;

    async fn z_card(&self, key: &str) -> Result<u64, StoreError>;

    /// Members by rank, inclusive, negative indexes counting from the end.
    async fn z_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError>;

    /// Prune the window, count it, and record `member` if under the limit.
    ///
    /// This default composes the primitives above and is not atomic across
    /// them. [`MemoryStore`] and [`RedisStore`] both override it with a single
    /// atomic step.
    async fn admit_in_window(
        &self,
        key: &str,
        member: &str,
        spec: WindowSpec,
    ) -> Result<WindowAdmission, StoreError> {
        self.z_remove_range_by_score(key, f64::NEG_INFINITY, spec.cutoff())
            .await?;
        let count = self.z_card(key).await?;
        if count >= spec.limit {
            let oldest = self.z_range(key, 0, 0).await?.first().map(|(_, s)| *s);
            return Ok(WindowAdmission {
                admitted: false,
                count,
                oldest,
            });
        }
        self.z_add(key, member, spec.now).await?;
        self.expire(key, spec.key_ttl).await?;
        Ok(WindowAdmission {
            admitted: true,
            count,
            oldest: None,
        })
    }
}
