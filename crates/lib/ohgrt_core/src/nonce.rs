//! Replay protection: each client nonce is accepted once per TTL.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::store::{KvStore, StoreError};

/// Records nonces in the shared store and rejects repeats.
#[derive(Clone)]
pub struct NonceGuard {
    store: Arc<dyn KvStore>,
}

impl NonceGuard {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Store key for a nonce. Hashed so client input never sizes the key.
    pub fn key_for(nonce: &str) -> String {
        format!("nonce:{:x}", Sha256::digest(nonce.as_bytes()))
    }

    /// `true` the first time `nonce` is seen within `ttl`, `false` after.
    ///
    /// Concurrent calls with the same nonce yield exactly one `true`.
    pub async fn check_and_store(&self, nonce: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.store
            .set_if_absent(&Self::key_for(nonce), "1", ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn guard() -> NonceGuard {
        NonceGuard::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn first_use_passes_and_repeat_fails() {
        let guard = guard();
        let ttl = Duration::from_secs(3600);
        assert!(guard.check_and_store("n-1", ttl).await.unwrap());
        assert!(!guard.check_and_store("n-1", ttl).await.unwrap());
        assert!(!guard.check_and_store("n-1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_nonces_are_independent() {
        let guard = guard();
        let ttl = Duration::from_secs(3600);
        assert!(guard.check_and_store("n-1", ttl).await.unwrap());
        assert!(guard.check_and_store("n-2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn nonce_is_reusable_after_ttl() {
        let guard = guard();
        let ttl = Duration::from_millis(50);
        assert!(guard.check_and_store("n-1", ttl).await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(guard.check_and_store("n-1", ttl).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_one() {
        let guard = guard();
        let mut handles = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .check_and_store("shared", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
    }

    #[test]
    fn key_is_bounded_and_hides_the_nonce() {
        let long = "x".repeat(10_000);
        let key = NonceGuard::key_for(&long);
        assert_eq!(key.len(), "nonce:".len() + 64);
        assert!(!NonceGuard::key_for("secret-nonce").contains("secret"));
    }
}
