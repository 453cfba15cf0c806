//! Consumed-nonce tracking for replay rejection.
//!
//! A decoded state is cryptographically valid for the whole TTL window, so
//! the callback handler additionally consumes its nonce: a valid-but-stale
//! state resubmitted within the window is rejected. The trait is the
//! contract: the in-process map serves a single instance; a shared keyed
//! store can be injected for horizontal deployments.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Nonce consumption interface.
pub trait NonceStore: Send + Sync {
    /// Atomically marks a nonce as consumed.
    ///
    /// Returns `true` if the nonce was unseen (now consumed), `false` if it
    /// was already consumed, in which case the caller must reject the callback.
    fn mark_consumed(&self, nonce: &str) -> bool;

    /// Drops entries older than the retention window. Entries only need to
    /// outlive the state TTL; after that the state itself is expired.
    fn cleanup_expired(&self);

    /// Number of tracked nonces (for monitoring).
    fn count(&self) -> usize;
}

/// In-process nonce store.
pub struct InMemoryNonceStore {
    seen: DashMap<String, DateTime<Utc>>,
    retention: Duration,
}

impl InMemoryNonceStore {
    /// # Arguments
    /// * `retention_seconds` - How long consumed nonces are remembered;
    ///   must be at least the state TTL
    pub fn new(retention_seconds: i64) -> Self {
        Self {
            seen: DashMap::new(),
            retention: Duration::seconds(retention_seconds),
        }
    }
}

impl NonceStore for InMemoryNonceStore {
    fn mark_consumed(&self, nonce: &str) -> bool {
        let mut fresh = false;
        self.seen.entry(nonce.to_string()).or_insert_with(|| {
            fresh = true;
            Utc::now()
        });
        fresh
    }

    fn cleanup_expired(&self) {
        let now = Utc::now();
        self.seen
            .retain(|_, consumed_at| now - *consumed_at <= self.retention);
    }

    fn count(&self) -> usize {
        self.seen.len()
    }
}

/// Background task to periodically clean up old nonces.
pub async fn run_nonce_cleanup(store: std::sync::Arc<dyn NonceStore>, interval_seconds: u64) {
    let mut interval =
        tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        store.cleanup_expired();
        tracing::debug!("Nonce cleanup complete, {} nonces tracked", store.count());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_single_use() {
        let store = InMemoryNonceStore::new(600);

        assert!(store.mark_consumed("nonce-1"));
        // Second presentation of the same nonce is rejected
        assert!(!store.mark_consumed("nonce-1"));
    }

    #[test]
    fn test_distinct_nonces_independent() {
        let store = InMemoryNonceStore::new(600);

        assert!(store.mark_consumed("nonce-1"));
        assert!(store.mark_consumed("nonce-2"));
        assert_eq!(store.count(), 2);
    }

    #[test]
    fn test_cleanup_removes_old_entries() {
        let store = InMemoryNonceStore::new(0); // immediate expiry

        store.mark_consumed("nonce-1");
        store.mark_consumed("nonce-2");
        assert_eq!(store.count(), 2);

        std::thread::sleep(std::time::Duration::from_millis(50));
        store.cleanup_expired();
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_cleanup_keeps_recent_entries() {
        let store = InMemoryNonceStore::new(600);

        store.mark_consumed("nonce-1");
        store.cleanup_expired();
        assert_eq!(store.count(), 1);
        // Still consumed after cleanup
        assert!(!store.mark_consumed("nonce-1"));
    }
}
