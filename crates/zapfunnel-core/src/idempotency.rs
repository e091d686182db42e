use std::{collections::HashMap, time::Duration};

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Short-TTL dedup of event/operation keys.
///
/// Shared by webhook ingestion and step dispatch: the same provider event,
/// the same reply, or the same step transition must only be processed once.
/// Entries are evicted lazily on each call.
pub struct IdempotencyGuard {
    default_ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyGuard {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key` if absent and return `false` ("not a duplicate").
    /// Return `true` if the key was already recorded within the default TTL.
    pub async fn seen(&self, key: &str) -> bool {
        self.seen_with_ttl(key, self.default_ttl).await
    }

    pub async fn seen_with_ttl(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        entries.retain(|_, recorded| now.duration_since(*recorded) <= ttl);

        if entries.contains_key(key) {
            return true;
        }
        entries.insert(key.to_string(), now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_seen_false_then_true_within_ttl() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        assert!(!guard.seen("k1").await);
        assert!(guard.seen("k1").await);
        assert!(!guard.seen("k2").await);
    }

    #[tokio::test]
    async fn entry_expires_after_ttl() {
        let guard = IdempotencyGuard::new(Duration::from_millis(40));
        assert!(!guard.seen("k").await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!guard.seen("k").await);
    }

    #[tokio::test]
    async fn per_call_ttl_overrides_default() {
        let guard = IdempotencyGuard::new(Duration::from_secs(60));
        assert!(!guard.seen_with_ttl("k", Duration::from_millis(40)).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!guard.seen_with_ttl("k", Duration::from_millis(40)).await);
    }
}
