//! # Cache Entry
//!
//! One stored value with its expiration instant and access metadata. Values
//! are opaque serializer output (`Arc<[u8]>`), shared with readers without
//! copying.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Expiration clamp for absurdly large TTLs (about ten years).
const MAX_TTL: Duration = Duration::from_secs(315_360_000);

/// A single entry within a named cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Opaque value payload, shared with readers.
    pub value: Arc<[u8]>,
    /// Absolute expiration instant.
    pub expires_at: Instant,
    /// Node that produced this value; informational only.
    pub origin_node: Arc<str>,
    /// Creation instant.
    pub created_at: Instant,
    /// Last access instant, updated by `touch`.
    pub last_accessed: Instant,
    /// Number of accesses since creation.
    pub access_count: u64,
}

impl CacheEntry {
    /// Builds an entry expiring `ttl` after `now`.
    pub fn new(value: Arc<[u8]>, ttl: Duration, origin_node: Arc<str>, now: Instant) -> Self {
        let expires_at = now
            .checked_add(ttl)
            .unwrap_or_else(|| now + MAX_TTL);
        CacheEntry {
            value,
            expires_at,
            origin_node,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    /// Returns true when the entry has expired at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Marks the entry as accessed.
    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
        self.access_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl: Duration) -> CacheEntry {
        CacheEntry::new(
            Arc::from(&b"value"[..]),
            ttl,
            Arc::from("node-a"),
            Instant::now(),
        )
    }

    #[test]
    fn fresh_entry_is_live() {
        let entry = entry(Duration::from_secs(10));
        assert!(!entry.is_expired(Instant::now()));
        assert_eq!(entry.access_count, 0);
    }

    #[test]
    fn entry_expires_at_deadline() {
        let entry = entry(Duration::from_millis(5));
        assert!(entry.is_expired(entry.expires_at));
        assert!(entry.is_expired(entry.expires_at + Duration::from_millis(1)));
    }

    #[test]
    fn touch_updates_access_metadata() {
        let mut entry = entry(Duration::from_secs(10));
        let later = Instant::now() + Duration::from_millis(50);
        entry.touch(later);
        entry.touch(later);
        assert_eq!(entry.access_count, 2);
        assert_eq!(entry.last_accessed, later);
    }

    #[test]
    fn huge_ttl_is_clamped_not_panicking() {
        let entry = entry(Duration::from_secs(u64::MAX));
        assert!(!entry.is_expired(Instant::now()));
    }
}
