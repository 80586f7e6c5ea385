//! Process-local store.
//!
//! Backs single-instance deployments and stands in for Redis while it is
//! unreachable. Every key lives in a [`DashMap`] shard, so each operation on
//! a key runs under that shard's lock and read-modify-write sequences on one
//! key cannot interleave.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{KvStore, StoreError, WindowAdmission, WindowSpec};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// Ascending by score.
    Sorted(Vec<(String, f64)>),
}

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn text(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::Text(value),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory implementation of [`KvStore`] with lazy TTL expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slots: DashMap<String, Slot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| !slot.is_expired(now));
        before.saturating_sub(self.slots.len())
    }

    /// Number of keys held, expired-but-unswept ones included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Entry for `key`, with an expired value already evicted.
    fn live_entry(&self, key: &str) -> Entry<'_, String, Slot> {
        match self.slots.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_expired(Instant::now()) => {
                occupied.remove();
                self.slots.entry(key.to_string())
            }
            entry => entry,
        }
    }
}

/// Insert or move `member` so the log stays ordered by score.
fn upsert_sorted(log: &mut Vec<(String, f64)>, member: &str, score: f64) {
    log.retain(|(m, _)| m != member);
    let at = log.partition_point(|(_, s)| *s <= score);
    log.insert(at, (member.to_string(), score));
}

/// Resolve Redis-style inclusive rank bounds against a length.
fn rank_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = i64::try_from(len).ok()?;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((usize::try_from(start).ok()?, usize::try_from(stop).ok()?))
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match &occupied.get().value {
                Value::Text(text) => Ok(Some(text.clone())),
                Value::Sorted(_) => Err(StoreError::WrongType(key.to_string())),
            },
            Entry::Vacant(_) => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.slots
            .insert(key.to_string(), Slot::text(value.to_string(), ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        match self.live_entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::text(value.to_string(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.slots.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let Value::Text(text) = &slot.value else {
                    return Err(StoreError::WrongType(key.to_string()));
                };
                let next = text
                    .parse::<i64>()
                    .map_err(|_| StoreError::WrongType(key.to_string()))?
                    + 1;
                slot.value = Value::Text(next.to_string());
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::text("1".to_string(), None));
                Ok(1)
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Entry::Occupied(mut occupied) = self.live_entry(key) {
            occupied.get_mut().expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn z_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        match self.live_entry(key) {
            Entry::Occupied(mut occupied) => match &mut occupied.get_mut().value {
                Value::Sorted(log) => {
                    upsert_sorted(log, member, score);
                    Ok(())
                }
                Value::Text(_) => Err(StoreError::WrongType(key.to_string())),
            },
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: Value::Sorted(vec![(member.to_string(), score)]),
                    expires_at: None,
                });
                Ok(())
            }
        }
    }

    async fn z_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError> {
        let Entry::Occupied(mut occupied) = self.live_entry(key) else {
            return Ok(0);
        };
        let Value::Sorted(log) = &mut occupied.get_mut().value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let before = log.len();
        log.retain(|(_, score)| *score < min || *score > max);
        let removed = before - log.len();
        if log.is_empty() {
            occupied.remove();
        }
        Ok(removed as u64)
    }

    async fn z_card(&self, key: &str) -> Result<u64, StoreError> {
        match self.live_entry(key) {
            Entry::Occupied(occupied) => match &occupied.get().value {
                Value::Sorted(log) => Ok(log.len() as u64),
                Value::Text(_) => Err(StoreError::WrongType(key.to_string())),
            },
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn z_range(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let Entry::Occupied(occupied) = self.live_entry(key) else {
            return Ok(Vec::new());
        };
        let Value::Sorted(log) = &occupied.get().value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        Ok(match rank_bounds(log.len(), start, stop) {
            Some((from, to)) => log[from..=to].to_vec(),
            None => Vec::new(),
        })
    }

    async fn admit_in_window(
        &self,
        key: &str,
        member: &str,
        spec: WindowSpec,
    ) -> Result<WindowAdmission, StoreError> {
        let mut slot = match self.live_entry(key) {
            Entry::Occupied(occupied) => occupied.into_ref(),
            Entry::Vacant(vacant) => vacant.insert(Slot {
                value: Value::Sorted(Vec::new()),
                expires_at: Some(Instant::now() + spec.key_ttl),
            }),
        };
        let slot = slot.value_mut();
        let Value::Sorted(log) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };

        let cutoff = spec.cutoff();
        log.retain(|(_, score)| *score > cutoff);
        let count = log.len() as u64;
        if count >= spec.limit {
            return Ok(WindowAdmission {
                admitted: false,
                count,
                oldest: log.first().map(|(_, score)| *score),
            });
        }

        upsert_sorted(log, member, spec.now);
        slot.expires_at = Some(Instant::now() + spec.key_ttl);
        Ok(WindowAdmission {
            admitted: true,
            count,
            oldest: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn get_returns_none_for_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_and_get_roundtrip() {
        let store = MemoryStore::new();
        store.set("k1", "v1", None).await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("k1", "v1", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_writes_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        assert!(store.set_if_absent("n", "1", ttl).await.unwrap());
        assert!(!store.set_if_absent("n", "1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_succeeds_after_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(30);
        assert!(store.set_if_absent("n", "1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.set_if_absent("n", "1", ttl).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_set_if_absent_has_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .set_if_absent("race", "1", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = MemoryStore::new();
        store.set("k1", "v1", None).await.unwrap();
        store.delete("k1").await.unwrap();
        assert_eq!(store.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn increment_counts_from_one() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("c").await.unwrap(), 1);
        assert_eq!(store.increment("c").await.unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap(), Some("2".to_string()));
    }

    #[tokio::test]
    async fn increment_rejects_non_numeric_text() {
        let store = MemoryStore::new();
        store.set("c", "abc", None).await.unwrap();
        assert!(matches!(
            store.increment("c").await,
            Err(StoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn sorted_set_orders_by_score() {
        let store = MemoryStore::new();
        store.z_add("z", "c", 3.0).await.unwrap();
        store.z_add("z", "a", 1.0).await.unwrap();
        store.z_add("z", "b", 2.0).await.unwrap();
        let all = store.z_range("z", 0, -1).await.unwrap();
        let members: Vec<&str> = all.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(members, ["a", "b", "c"]);
        assert_eq!(store.z_range("z", 0, 0).await.unwrap()[0].0, "a");
        assert_eq!(store.z_range("z", -1, -1).await.unwrap()[0].0, "c");
        assert!(store.z_range("z", 5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn z_add_updates_existing_member_score() {
        let store = MemoryStore::new();
        store.z_add("z", "a", 1.0).await.unwrap();
        store.z_add("z", "b", 2.0).await.unwrap();
        store.z_add("z", "a", 3.0).await.unwrap();
        assert_eq!(store.z_card("z").await.unwrap(), 2);
        assert_eq!(store.z_range("z", -1, -1).await.unwrap()[0].0, "a");
    }

    #[tokio::test]
    async fn z_remove_range_by_score_is_inclusive() {
        let store = MemoryStore::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            store.z_add("z", member, score).await.unwrap();
        }
        let removed = store.z_remove_range_by_score("z", 1.0, 2.0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.z_card("z").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn text_and_sorted_values_do_not_mix() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(matches!(
            store.z_add("k", "m", 1.0).await,
            Err(StoreError::WrongType(_))
        ));
        store.z_add("z", "m", 1.0).await.unwrap();
        assert!(matches!(store.get("z").await, Err(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn purge_expired_drops_only_stale_entries() {
        let store = MemoryStore::new();
        store
            .set("short", "1", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        store.set("forever", "1", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn admit_in_window_stops_at_limit() {
        let store = MemoryStore::new();
        let spec = |now| WindowSpec {
            now,
            window: Duration::from_secs(10),
            limit: 2,
            key_ttl: Duration::from_secs(70),
        };
        assert!(store.admit_in_window("w", "r1", spec(100.0)).await.unwrap().admitted);
        assert!(store.admit_in_window("w", "r2", spec(101.0)).await.unwrap().admitted);
        let denied = store.admit_in_window("w", "r3", spec(102.0)).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.count, 2);
        assert_eq!(denied.oldest, Some(100.0));
        // r1 falls out of the window at 110.0.
        assert!(store.admit_in_window("w", "r4", spec(110.5)).await.unwrap().admitted);
    }

    #[test]
    fn rank_bounds_follow_redis_semantics() {
        assert_eq!(rank_bounds(3, 0, -1), Some((0, 2)));
        assert_eq!(rank_bounds(3, -2, -1), Some((1, 2)));
        assert_eq!(rank_bounds(3, 1, 100), Some((1, 2)));
        assert_eq!(rank_bounds(3, 2, 1), None);
        assert_eq!(rank_bounds(0, 0, -1), None);
    }
}
