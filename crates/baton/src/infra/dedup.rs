//! TTL-based deduplication of inbound platform events.
//!
//! Chat platforms redeliver webhooks and long-poll updates; adapters check
//! each event id here and drop anything seen within the TTL window.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Default dedup window: five minutes.
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(300);

/// Remembered event ids with their expiry deadlines.
pub struct DedupCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    /// Creates a cache with the given TTL window.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records `event_id` and reports whether it was fresh.
    ///
    /// Returns `false` for duplicates still inside the TTL window. Expired
    /// entries are pruned on the way.
    pub fn check_and_insert(&self, event_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        entries.retain(|_, expires_at| *expires_at > now);

        if entries.contains_key(event_id) {
            return false;
        }
        entries.insert(event_id.to_string(), now + self.ttl);

        true
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_ttl_is_dropped() {
        // Arrange
        let cache = DedupCache::default();

        // Act & Assert
        assert!(cache.check_and_insert("evt-1"));
        assert!(!cache.check_and_insert("evt-1"));
        assert!(cache.check_and_insert("evt-2"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_accepted_again() {
        // Arrange
        let cache = DedupCache::new(Duration::from_millis(20));

        // Act
        assert!(cache.check_and_insert("evt-1"));
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Assert
        assert!(cache.check_and_insert("evt-1"));
    }
}
