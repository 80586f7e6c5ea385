//! Redis-backed store.
//!
//! The connection is lazy and cached: a [`redis::aio::MultiplexedConnection`]
//! is opened on first use and shared by every caller. Each command runs under
//! an explicit timeout so a stalled Redis surfaces as [`StoreError::Timeout`]
//! instead of a hung request.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue, RedisError, Script};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{KvStore, StoreError, WindowAdmission, WindowSpec};

/// Prune, count and conditionally append, in one server-side step.
///
/// KEYS[1] = window key
/// ARGV = now, window seconds, limit, key ttl (ms), member
const WINDOW_SCRIPT: &str = r"
local cutoff = tonumber(ARGV[1]) - tonumber(ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
local count = redis.call('ZCARD', KEYS[1])
if count >= tonumber(ARGV[3]) then
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  return {0, count, oldest[2] or ''}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[5])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return {1, count, ''}
";

/// Lifecycle of the cached Redis connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed(_) => "failed",
        }
    }
}

struct Link {
    state: ConnectionState,
    connection: Option<MultiplexedConnection>,
}

/// [`KvStore`] over a single Redis endpoint.
pub struct RedisStore {
    client: redis::Client,
    link: RwLock<Link>,
    timeout: Duration,
    window_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn classify(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection(err.to_string())
    } else if err.is_timeout() {
        StoreError::Timeout("redis")
    } else {
        StoreError::Command(err.to_string())
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn score_bound(value: f64) -> String {
    if value == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if value == f64::INFINITY {
        "+inf".to_string()
    } else {
        value.to_string()
    }
}

impl RedisStore {
    /// Parse the URL. No connection is made until first use.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            link: RwLock::new(Link {
                state: ConnectionState::Disconnected,
                connection: None,
            }),
            timeout,
            window_script: Script::new(WINDOW_SCRIPT),
        })
    }

    pub async fn state(&self) -> ConnectionState {
        self.link.read().await.state.clone()
    }

    /// Claim the right to run a connection attempt.
    ///
    /// Returns `false` when another attempt is in flight or the link is up.
    pub async fn begin_connect(&self) -> bool {
        let mut link = self.link.write().await;
        match link.state {
            ConnectionState::Disconnected | ConnectionState::Failed(_) => {
                link.state = ConnectionState::Connecting;
                true
            }
            ConnectionState::Connecting | ConnectionState::Connected => false,
        }
    }

    /// Open a connection and verify it with `PING`.
    pub async fn connect(&self) -> Result<(), StoreError> {
        let attempt = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, RedisError>(conn)
        };

        let outcome = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(classify(e)),
            Err(_) => Err(StoreError::Timeout("connect")),
        };

        let mut link = self.link.write().await;
        match outcome {
            Ok(conn) => {
                link.connection = Some(conn);
                link.state = ConnectionState::Connected;
                info!("Redis connected");
                Ok(())
            }
            Err(e) => {
                link.connection = None;
                link.state = ConnectionState::Failed(e.to_string());
                warn!("Redis connection failed: {e}");
                Err(e)
            }
        }
    }

    /// Drop the cached connection so the next health tick reconnects.
    pub async fn mark_failed(&self, reason: &str) {
        let mut link = self.link.write().await;
        link.connection = None;
        link.state = ConnectionState::Failed(reason.to_string());
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        let _: String = self.run("ping", &redis::cmd("PING")).await?;
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        let link = self.link.read().await;
        link.connection
            .clone()
            .ok_or_else(|| StoreError::Connection(format!("redis {}", link.state.as_str())))
    }

    async fn run<T: FromRedisValue>(&self, op: &'static str, cmd: &Cmd) -> Result<T, StoreError> {
        let mut conn = self.connection().await?;
        let reply: Result<T, RedisError> =
            match tokio::time::timeout(self.timeout, cmd.query_async(&mut conn)).await {
                Ok(reply) => reply,
                Err(_) => return Err(StoreError::Timeout(op)),
            };
        reply.map_err(classify)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.run("get", redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let _: () = self.run("set", &cmd).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let reply: Option<String> = self
            .run(
                "set_if_absent",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl)),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = self.run("delete", redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        self.run("increment", redis::cmd("INCR").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let _: i64 = self
            .run(
                "expire",
                redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)),
            )
            .await?;
        Ok(())
    }

    async fn z_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let _: i64 = self
            .run("z_add", redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn z_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        self.run(
            "z_remove_range_by_score",
            redis::cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_bound(min))
                .arg(score_bound(max)),
        )
        .await
    }

    async fn z_card(&self, key: &str) -> Result<u64, StoreError> {
        self.run("z_card", redis::cmd("ZCARD").arg(key)).await
    }

    async fn z_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        self.run(
            "z_range",
            redis::cmd("ZRANGE")
                .arg(key)
                .arg(start)
                .arg(stop)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn admit_in_window(
        &self,
        key: &str,
        member: &str,
        spec: WindowSpec,
    ) -> Result<WindowAdmission, StoreError> {
        let mut conn = self.connection().await?;
        let mut invocation = self.window_script.prepare_invoke();
        invocation
            .key(key)
            .arg(format!("{:.6}", spec.now))
            .arg(spec.window.as_secs_f64())
            .arg(spec.limit)
            .arg(ttl_millis(spec.key_ttl))
            .arg(member);

        let reply: Result<(i64, u64, String), RedisError> =
            match tokio::time::timeout(self.timeout, invocation.invoke_async(&mut conn)).await {
                Ok(reply) => reply,
                Err(_) => return Err(StoreError::Timeout("admit_in_window")),
            };
        let (admitted, count, oldest) = reply.map_err(classify)?;

        Ok(WindowAdmission {
            admitted: admitted == 1,
            count,
            oldest: oldest.parse::<f64>().ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        let err = RedisStore::new("not a url", Duration::from_millis(100)).unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn starts_disconnected_and_claims_connect_once() {
        let store = RedisStore::new("redis://127.0.0.1:1/0", Duration::from_millis(100)).unwrap();
        assert_eq!(store.state().await, ConnectionState::Disconnected);
        assert!(store.begin_connect().await);
        assert!(!store.begin_connect().await);
        assert_eq!(store.state().await, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn commands_without_connection_are_connectivity_errors() {
        let store = RedisStore::new("redis://127.0.0.1:1/0", Duration::from_millis(100)).unwrap();
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_connectivity());
    }

    #[tokio::test]
    async fn failed_connect_is_recorded() {
        // Port 1 refuses connections on any sane host.
        let store = RedisStore::new("redis://127.0.0.1:1/0", Duration::from_millis(500)).unwrap();
        assert!(store.connect().await.is_err());
        assert!(matches!(store.state().await, ConnectionState::Failed(_)));
        assert!(store.begin_connect().await);
    }

    #[test]
    fn score_bounds_render_infinities() {
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(1.5), "1.5");
    }

    #[test]
    fn ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
    }
}
