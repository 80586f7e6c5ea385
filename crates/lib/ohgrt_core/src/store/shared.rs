//! Redis-first store with an in-process fallback.
//!
//! Calls go to Redis while the link is up. A failed or timed-out Redis call is
//! logged and replayed against the local [`MemoryStore`] for that call, unless
//! fallback is disabled, in which case the caller gets
//! [`StoreError::Unavailable`]. Reconnection happens on a background health
//! check and never inside a request.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ConnectionState, KvStore, MemoryStore, RedisStore, StoreError, WindowAdmission, WindowSpec,
};
use crate::settings::StoreSettings;

/// Minimum gap between two fallback warnings.
const FALLBACK_WARN_EVERY_SECS: u64 = 30;

pub struct SharedStore {
    remote: Option<Arc<RedisStore>>,
    local: MemoryStore,
    allow_fallback: bool,
    /// Unix seconds of the last fallback warning, 0 if none yet.
    fallback_warned_at: AtomicU64,
}

/// Try the remote store first, then the local one.
macro_rules! route {
    ($self:ident, $op:literal, |$store:ident| $call:expr) => {{
        if let Some(remote) = $self.active_remote().await? {
            let $store: &dyn KvStore = remote.as_ref();
            match $call {
                Ok(value) => return Ok(value),
                Err(err) => $self.degrade(&remote, $op, err).await?,
            }
        }
        let $store: &dyn KvStore = &$self.local;
        $call
    }};
}

impl SharedStore {
    pub fn new(remote: Option<RedisStore>, allow_fallback: bool) -> Self {
        Self {
            remote: remote.map(Arc::new),
            local: MemoryStore::new(),
            allow_fallback,
            fallback_warned_at: AtomicU64::new(0),
        }
    }

    /// Local-only store, for tests and single-process deployments.
    pub fn memory_only() -> Self {
        Self::new(None, true)
    }

    /// Build from settings. An empty Redis URL means memory only.
    pub fn from_settings(settings: &StoreSettings) -> Result<Self, StoreError> {
        let remote = match settings.redis_url.as_deref() {
            Some(url) if !url.trim().is_empty() => {
                Some(RedisStore::new(url, settings.timeout())?)
            }
            _ => None,
        };
        Ok(Self::new(remote, settings.allow_memory_fallback))
    }

    /// `None` when no Redis endpoint is configured.
    pub async fn connection_state(&self) -> Option<ConnectionState> {
        match &self.remote {
            Some(remote) => Some(remote.state().await),
            None => None,
        }
    }

    pub fn local(&self) -> &MemoryStore {
        &self.local
    }

    /// Remote store to use for this call, if any.
    async fn active_remote(&self) -> Result<Option<Arc<RedisStore>>, StoreError> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        let state = remote.state().await;
        if state == ConnectionState::Connected {
            return Ok(Some(Arc::clone(remote)));
        }
        if state == ConnectionState::Disconnected && remote.begin_connect().await {
            let remote = Arc::clone(remote);
            tokio::spawn(async move {
                let _ = remote.connect().await;
            });
        }
        if self.allow_fallback {
            self.note_fallback(&state, crate::unix_now() as u64);
            Ok(None)
        } else {
            Err(StoreError::Unavailable(format!("redis {}", state.as_str())))
        }
    }

    /// Log that a call is served from memory. Warns at most once per
    /// [`FALLBACK_WARN_EVERY_SECS`]; returns whether this call warned.
    fn note_fallback(&self, state: &ConnectionState, now: u64) -> bool {
        let last = self.fallback_warned_at.load(Ordering::Relaxed);
        let due = last == 0 || now.saturating_sub(last) >= FALLBACK_WARN_EVERY_SECS;
        if due
            && self
                .fallback_warned_at
                .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            warn!(redis = state.as_str(), "Redis unavailable, serving from memory");
            return true;
        }
        debug!(redis = state.as_str(), "Serving from memory");
        false
    }

    async fn degrade(
        &self,
        remote: &RedisStore,
        op: &'static str,
        err: StoreError,
    ) -> Result<(), StoreError> {
        warn!(op, "Redis store error, falling back to memory: {err}");
        if err.is_connectivity() {
            remote.mark_failed(&err.to_string()).await;
        }
        if self.allow_fallback {
            Ok(())
        } else {
            Err(StoreError::Unavailable(err.to_string()))
        }
    }

    /// One health-check pass: sweep local expiries and probe or reconnect Redis.
    pub async fn health_tick(&self) {
        let purged = self.local.purge_expired();
        if purged > 0 {
            debug!(purged, "Purged expired local store entries");
        }

        let Some(remote) = &self.remote else {
            return;
        };
        match remote.state().await {
            ConnectionState::Connected => {
                if let Err(e) = remote.ping().await {
                    warn!("Redis health check failed: {e}");
                    remote.mark_failed(&e.to_string()).await;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                if remote.begin_connect().await {
                    let _ = remote.connect().await;
                }
            }
            ConnectionState::Connecting => {}
        }
    }

    /// Run [`Self::health_tick`] every `every` until `cancel` fires.
    pub fn spawn_health_check(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => store.health_tick().await,
                }
            }
            debug!("Store health check stopped");
        })
    }
}

#[async_trait]
impl KvStore for SharedStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        route!(self, "get", |store| store.get(key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        route!(self, "set", |store| store.set(key, value, ttl).await)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        route!(self, "set_if_absent", |store| store
            .set_if_absent(key, value, ttl)
            .await)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        route!(self, "delete", |store| store.delete(key).await)
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        route!(self, "increment", |store| store.increment(key).await)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        route!(self, "expire", |store| store.expire(key, ttl).await)
    }

    async fn z_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        route!(self, "z_add", |store| store.z_add(key, member, score).await)
    }

    async fn z_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        route!(self, "z_remove_range_by_score", |store| store
            .z_remove_range_by_score(key, min, max)
            .await)
    }

    async fn z_card(&self, key: &str) -> Result<u64, StoreError> {
        route!(self, "z_card", |store| store.z_card(key).await)
    }

    async fn z_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        route!(self, "z_range", |store| store.z_range(key, start, stop).await)
    }

    async fn admit_in_window(
        &self,
        key: &str,
        member: &str,
        spec: WindowSpec,
    ) -> Result<WindowAdmission, StoreError> {
        route!(self, "admit_in_window", |store| store
            .admit_in_window(key, member, spec)
            .await)
    }
}
