//! # Cache Statistics
//!
//! Purpose: Aggregate per-cache hit/miss/eviction counters and size gauges
//! cheaply enough to sit on the hot path.
//!
//! ## Design Principles
//! 1. **Accumulator Pattern**: Atomic counters make record calls
//!    zero-allocation; `Ordering::Relaxed` suffices because no cross-field
//!    ordering is required.
//! 2. **Monotone Counters**: Hits, misses, and evictions only ever grow for
//!    the lifetime of the node.
//! 3. **Snapshot Access**: Readers get a plain struct, stamped with the
//!    observation time.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use meshcache_common::wire::epoch_ms;
use meshcache_common::EvictionPolicy;

/// Thread-safe statistics for one named cache.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    evictions_lru: AtomicU64,
    evictions_lfu: AtomicU64,
    evictions_ttl_only: AtomicU64,
    size: AtomicU64,
    memory_bytes: AtomicU64,
}

impl CacheStats {
    /// Creates a zeroed statistics block.
    pub fn new() -> Self {
        CacheStats::default()
    }

    /// Records a successful lookup.
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a failed or expired lookup.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one eviction, tagged with the policy that selected the victim.
    pub fn record_eviction(&self, policy: EvictionPolicy) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        let tagged = match policy {
            EvictionPolicy::Lru => &self.evictions_lru,
            EvictionPolicy::Lfu => &self.evictions_lfu,
            EvictionPolicy::TtlOnly => &self.evictions_ttl_only,
        };
        tagged.fetch_add(1, Ordering::Relaxed);
    }

    /// Publishes the current size and estimated memory gauges.
    ///
    /// Called under the cache write lock so gauges stay consistent with the
    /// entry map.
    pub fn set_gauges(&self, size: u64, memory_bytes: u64) {
        self.size.store(size, Ordering::Relaxed);
        self.memory_bytes.store(memory_bytes, Ordering::Relaxed);
    }

    /// Returns a point-in-time snapshot of all counters and gauges.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            evictions_lru: self.evictions_lru.load(Ordering::Relaxed),
            evictions_lfu: self.evictions_lfu.load(Ordering::Relaxed),
            evictions_ttl_only: self.evictions_ttl_only.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            estimated_memory_bytes: self.memory_bytes.load(Ordering::Relaxed),
            observed_at_ms: epoch_ms(),
        }
    }
}

/// Snapshot of one cache's statistics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub evictions_lru: u64,
    pub evictions_lfu: u64,
    pub evictions_ttl_only: u64,
    pub size: u64,
    pub estimated_memory_bytes: u64,
    /// Observation timestamp, epoch milliseconds.
    pub observed_at_ms: i64,
}

impl StatsSnapshot {
    /// Zeroed snapshot for caches that do not exist yet.
    pub fn empty() -> Self {
        StatsSnapshot {
            hits: 0,
            misses: 0,
            evictions: 0,
            evictions_lru: 0,
            evictions_lfu: 0,
            evictions_ttl_only: 0,
            size: 0,
            estimated_memory_bytes: 0,
            observed_at_ms: epoch_ms(),
        }
    }
}
