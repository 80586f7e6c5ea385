//! Sliding-window rate limiting.
//!
//! Each client has a minute window and an hour window, each a sorted set of
//! request timestamps in the shared store. A request is admitted only if both
//! windows have room. The minute window is checked first, and the first
//! window that refuses decides the outcome.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::settings::RateLimitSettings;
use crate::store::{KvStore, WindowSpec};

/// The two windows every request is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Minute,
    Hour,
}

impl WindowKind {
    pub fn length(self) -> Duration {
        match self {
            Self::Minute => Duration::from_secs(60),
            Self::Hour => Duration::from_secs(3600),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
        }
    }

    pub fn limit_type(self) -> &'static str {
        match self {
            Self::Minute => "per_minute",
            Self::Hour => "per_hour",
        }
    }

    /// Message shown to a client that exhausted this window.
    pub fn client_message(self) -> &'static str {
        match self {
            Self::Minute => "Too many requests. Please slow down.",
            Self::Hour => "Hourly rate limit exceeded. Please try again later.",
        }
    }
}

/// Result of one window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: u64,
    /// Seconds until a slot frees up. Zero when allowed.
    pub retry_after_secs: u64,
}

/// Result of checking a request against both windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOutcome {
    Allowed {
        limit: u64,
        remaining: u64,
        /// Unix seconds at which the minute window resets.
        reset_at: u64,
    },
    Limited {
        window: WindowKind,
        retry_after_secs: u64,
    },
}

/// Who a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentity {
    User(String),
    Address(String),
}

impl ClientIdentity {
    /// Address from the first `X-Forwarded-For` hop, then `X-Real-IP`, then
    /// the socket peer.
    pub fn from_address(
        forwarded_for: Option<&str>,
        real_ip: Option<&str>,
        peer: Option<&str>,
    ) -> Self {
        let first_hop = forwarded_for
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        let real_ip = real_ip.map(str::trim).filter(|v| !v.is_empty());
        let addr = first_hop.or(real_ip).or(peer).unwrap_or("unknown");
        Self::Address(addr.to_string())
    }

    pub fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Address(addr) => format!("ip:{addr}"),
        }
    }
}

pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    per_minute: u64,
    per_hour: u64,
    key_buffer: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, settings: &RateLimitSettings) -> Self {
        Self {
            store,
            per_minute: settings.per_minute,
            per_hour: settings.per_hour,
            key_buffer: settings.key_buffer,
        }
    }

    pub fn limit_for(&self, kind: WindowKind) -> u64 {
        match kind {
            WindowKind::Minute => self.per_minute,
            WindowKind::Hour => self.per_hour,
        }
    }

    /// Check and record one request against a single window.
    pub async fn is_allowed(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
    ) -> WindowDecision {
        self.is_allowed_at(key, max_requests, window, crate::unix_now())
            .await
    }

    /// [`Self::is_allowed`] at an explicit time.
    ///
    /// Store failures admit the request with a warning.
    pub async fn is_allowed_at(
        &self,
        key: &str,
        max_requests: u64,
        window: Duration,
        now: f64,
    ) -> WindowDecision {
        let spec = WindowSpec {
            now,
            window,
            limit: max_requests,
            key_ttl: window + self.key_buffer,
        };
        let member = format!("{now:.6}:{}", uuid::Uuid::new_v4().simple());

        let admission = match self.store.admit_in_window(key, &member, spec).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(key, "Rate limit check failed, allowing request: {e}");
                return WindowDecision {
                    allowed: true,
                    remaining: max_requests,
                    retry_after_secs: 0,
                };
            }
        };

        if admission.admitted {
            WindowDecision {
                allowed: true,
                remaining: max_requests.saturating_sub(admission.count + 1),
                retry_after_secs: 0,
            }
        } else {
            let oldest = admission.oldest.unwrap_or(now);
            let until_free = (oldest + window.as_secs_f64() - now).trunc() as i64 + 1;
            WindowDecision {
                allowed: false,
                remaining: 0,
                retry_after_secs: until_free.max(1) as u64,
            }
        }
    }

    /// Check a client against the minute window, then the hour window.
    pub async fn check(&self, client: &ClientIdentity) -> RateLimitOutcome {
        self.check_at(client, crate::unix_now()).await
    }

    pub async fn check_at(&self, client: &ClientIdentity, now: f64) -> RateLimitOutcome {
        let client_key = client.key();
        let mut minute_remaining = self.per_minute;

        for kind in [WindowKind::Minute, WindowKind::Hour] {
            let key = format!("ratelimit:{client_key}:{}", kind.as_str());
            let decision = self
                .is_allowed_at(&key, self.limit_for(kind), kind.length(), now)
                .await;
            if !decision.allowed {
                warn!(
                    client = %client_key,
                    limit_type = kind.limit_type(),
                    retry_after = decision.retry_after_secs,
                    "rate_limit_exceeded"
                );
                return RateLimitOutcome::Limited {
                    window: kind,
                    retry_after_secs: decision.retry_after_secs,
                };
            }
            if kind == WindowKind::Minute {
                minute_remaining = decision.remaining;
            }
        }

        debug!(client = %client_key, remaining = minute_remaining, "Request admitted");
        RateLimitOutcome::Allowed {
            limit: self.per_minute,
            remaining: minute_remaining,
            reset_at: now as u64 + WindowKind::Minute.length().as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::store::{MemoryStore, StoreError};

    fn limiter(store: Arc<dyn KvStore>, per_minute: u64, per_hour: u64) -> RateLimiter {
        let settings = RateLimitSettings {
            per_minute,
            per_hour,
            ..RateLimitSettings::default()
        };
        RateLimiter::new(store, &settings)
    }

    #[tokio::test]
    async fn remaining_counts_down_then_denies() {
        let limiter = limiter(Arc::new(MemoryStore::new()), 3, 100);
        let window = Duration::from_secs(60);
        let mut remaining = Vec::new();
        for i in 0..3 {
            let d = limiter.is_allowed_at("k", 3, window, 1000.0 + i as f64).await;
            assert!(d.allowed);
            remaining.push(d.remaining);
        }
        assert_eq!(remaining, [2, 1, 0]);

        let denied = limiter.is_allowed_at("k", 3, window, 1003.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // Oldest entry at 1000.0 leaves the window at 1060.0.
        assert_eq!(denied.retry_after_secs, 58);
    }

    #[tokio::test]
    async fn admits_again_once_the_window_slides() {
        let limiter = limiter(Arc::new(MemoryStore::new()), 2, 100);
        let window = Duration::from_secs(60);
        assert!(limiter.is_allowed_at("k", 2, window, 1000.0).await.allowed);
        assert!(limiter.is_allowed_at("k", 2, window, 1001.0).await.allowed);
        assert!(!limiter.is_allowed_at("k", 2, window, 1030.0).await.allowed);
        assert!(limiter.is_allowed_at("k", 2, window, 1060.5).await.allowed);
    }

    #[tokio::test]
    async fn retry_after_is_at_least_one_second() {
        let limiter = limiter(Arc::new(MemoryStore::new()), 1, 100);
        let window = Duration::from_secs(60);
        assert!(limiter.is_allowed_at("k", 1, window, 1000.0).await.allowed);
        let denied = limiter.is_allowed_at("k", 1, window, 1059.99).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_exceed_the_limit() {
        let store = Arc::new(crate::store::SharedStore::memory_only());
        let limiter = Arc::new(limiter(store, 10, 100));
        let window = Duration::from_secs(60);

        let mut handles = Vec::new();
        for i in 0..32 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .is_allowed_at("shared", 10, window, 1000.0 + f64::from(i) * 0.001)
                    .await
                    .allowed
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn keys_are_counted_independently() {
        let limiter = limiter(Arc::new(MemoryStore::new()), 1, 100);
        let window = Duration::from_secs(60);
        assert!(limiter.is_allowed_at("a", 1, window, 1000.0).await.allowed);
        assert!(limiter.is_allowed_at("b", 1, window, 1000.0).await.allowed);
        assert!(!limiter.is_allowed_at("a", 1, window, 1000.5).await.allowed);
    }

    #[tokio::test]
    async fn check_reports_minute_headers_on_success() {
        let limiter = limiter(Arc::new(MemoryStore::new()), 5, 100);
        let client = ClientIdentity::User("u1".into());
        let outcome = limiter.check_at(&client, 2000.0).await;
        assert_eq!(
            outcome,
            RateLimitOutcome::Allowed {
                limit: 5,
                remaining: 4,
                reset_at: 2060,
            }
        );
    }

    #[tokio::test]
    async fn minute_failure_skips_the_hour_window() {
        let store = Arc::new(MemoryStore::new());
        let limiter = limiter(store.clone(), 1, 100);
        let client = ClientIdentity::Address("10.0.0.1".into());
        assert!(matches!(
            limiter.check_at(&client, 3000.0).await,
            RateLimitOutcome::Allowed { .. }
        ));
        let outcome = limiter.check_at(&client, 3001.0).await;
        assert!(matches!(
            outcome,
            RateLimitOutcome::Limited {
                window: WindowKind::Minute,
                ..
            }
        ));
        assert_eq!(store.z_card("ratelimit:ip:10.0.0.1:hour").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hour_window_limits_after_minute_admits() {
        let limiter = limiter(Arc::new(MemoryStore::new()), 10, 2);
        let client = ClientIdentity::User("u1".into());
        for t in [0.0, 100.0] {
            assert!(matches!(
                limiter.check_at(&client, 5000.0 + t).await,
                RateLimitOutcome::Allowed { .. }
            ));
        }
        let outcome = limiter.check_at(&client, 5200.0).await;
        assert_eq!(
            outcome,
            RateLimitOutcome::Limited {
                window: WindowKind::Hour,
                retry_after_secs: 3401,
            }
        );
    }

    #[test]
    fn identity_prefers_user_then_forwarded_address() {
        assert_eq!(ClientIdentity::User("42".into()).key(), "user:42");
        let id = ClientIdentity::from_address(
            Some(" 203.0.113.7 , 10.0.0.1"),
            Some("198.51.100.2"),
            Some("127.0.0.1"),
        );
        assert_eq!(id.key(), "ip:203.0.113.7");
        let id = ClientIdentity::from_address(None, Some("198.51.100.2"), Some("127.0.0.1"));
        assert_eq!(id.key(), "ip:198.51.100.2");
        let id = ClientIdentity::from_address(None, None, Some("127.0.0.1"));
        assert_eq!(id.key(), "ip:127.0.0.1");
        assert_eq!(ClientIdentity::from_address(None, None, None).key(), "ip:unknown");
    }

    /// Exposes only the primitives so the default window step runs.
    struct PrimitivesOnly(MemoryStore);

    #[async_trait]
    impl KvStore for PrimitivesOnly {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn set(
            &self,
            key: &str,
            value: &str,
            ttl: Option<Duration>,
        ) -> Result<(), StoreError> {
            self.0.set(key, value, ttl).await
        }
        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.0.set_if_absent(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
        async fn increment(&self, key: &str) -> Result<i64, StoreError> {
            self.0.increment(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
            self.0.expire(key, ttl).await
        }
        async fn z_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
            self.0.z_add(key, member, score).await
        }
        async fn z_remove_range_by_score(
            &self,
            key: &str,
            min: f64,
            max: f64,
        ) -> Result<u64, StoreError> {
            self.0.z_remove_range_by_score(key, min, max).await
        }
        async fn z_card(&self, key: &str) -> Result<u64, StoreError> {
            self.0.z_card(key).await
        }
        async fn z_range(
            &self,
            key: &str,
            start: i64,
            stop: i64,
        ) -> Result<Vec<(String, f64)>, StoreError> {
            self.0.z_range(key, start, stop).await
        }
    }

    #[tokio::test]
    async fn composed_window_step_matches_native_one() {
        let limiter = limiter(Arc::new(PrimitivesOnly(MemoryStore::new())), 2, 100);
        let window = Duration::from_secs(60);
        assert_eq!(limiter.is_allowed_at("k", 2, window, 1000.0).await.remaining, 1);
        assert_eq!(limiter.is_allowed_at("k", 2, window, 1001.0).await.remaining, 0);
        let denied = limiter.is_allowed_at("k", 2, window, 1002.0).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, 59);
        assert!(limiter.is_allowed_at("k", 2, window, 1060.5).await.allowed);
    }

    struct Broken;

    #[async_trait]
    impl KvStore for Broken {
        async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_if_absent(&self, _: &str, _: &str, _: Duration) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn increment(&self, _: &str) -> Result<i64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn z_add(&self, _: &str, _: &str, _: f64) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn z_remove_range_by_score(
            &self,
            _: &str,
            _: f64,
            _: f64,
        ) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn z_card(&self, _: &str) -> Result<u64, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn z_range(&self, _: &str, _: i64, _: i64) -> Result<Vec<(String, f64)>, StoreError> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failure_admits_the_request() {
        let limiter = limiter(Arc::new(Broken), 1, 1);
        let client = ClientIdentity::User("u1".into());
        for _ in 0..3 {
            assert!(matches!(
                limiter.check_at(&client, 1000.0).await,
                RateLimitOutcome::Allowed { .. }
            ));
        }
    }
}
