//! # Cache Store
//!
//! Provide the concurrent map of named caches with TTL enforcement on
//! access, bounded size, and eviction under three policies.
//!
//! ## Design Principles
//! 1. **Lazy Caches**: An unknown cache is a miss on `get` and springs into
//!    existence with the default configuration on `put`.
//! 2. **Per-Cache Locking**: One `RwLock` per named cache serializes
//!    mutations; other caches stay uncontended.
//! 3. **Evict Before Install**: The eviction precondition runs before every
//!    insert, so size never exceeds the budget after a mutation returns.
//! 4. **Bounded Victim Scan**: Victims are selected in O(n log k) with a
//!    max-heap of size k; ties break on the lexicographically smallest key
//!    so eviction is deterministic.
//!
//! ## Structure Overview
//!
//! ```text
//! CacheStore
//!   └── caches: RwLock<HashMap<name, Arc<NamedCache>>>
//!         └── NamedCache
//!               ├── config: RwLock<CacheConfig>
//!               ├── stats: CacheStats
//!               └── inner: RwLock<CacheInner>
//!                     ├── entries: HashMap<key, CacheEntry>
//!                     ├── memory_bytes (exact, incremental)
//!                     └── epoch (base instant for eviction ranks)
//! ```

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use meshcache_common::{CacheConfig, CacheResult, EvictionPolicy};

use crate::entry::CacheEntry;
use crate::sizer;
use crate::stats::{CacheStats, StatsSnapshot};

/// Concurrent registry of named caches.
#[derive(Debug, Default)]
pub struct CacheStore {
    caches: RwLock<HashMap<String, Arc<NamedCache>, RandomState>>,
}

/// One named cache: configuration, entries, and statistics.
#[derive(Debug)]
struct NamedCache {
    config: RwLock<CacheConfig>,
    inner: RwLock<CacheInner>,
    stats: CacheStats,
}

#[derive(Debug)]
struct CacheInner {
    entries: HashMap<String, CacheEntry, RandomState>,
    /// Exact estimated memory, maintained incrementally.
    memory_bytes: u64,
    /// Base instant for converting entry instants into comparable ranks.
    epoch: Instant,
}

/// Rank used by the bounded victim heap; smaller ranks are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EvictionRank {
    Time(Duration),
    Count(u64),
}

impl CacheStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        CacheStore::default()
    }

    /// Installs or replaces the configuration of a cache, creating it if
    /// needed. Existing entries are preserved.
    pub fn configure(&self, name: &str, config: CacheConfig) -> CacheResult<()> {
        config.validate()?;
        let cache = self.cache_or_create(name);
        *cache.config.write() = config;
        Ok(())
    }

    /// Inserts or replaces one entry, creating the cache lazily.
    ///
    /// The expiration is `now + ttl_override.unwrap_or(config.ttl)`; the
    /// eviction precondition runs before the install.
    pub fn put(
        &self,
        name: &str,
        key: impl Into<String>,
        value: Arc<[u8]>,
        ttl_override: Option<Duration>,
        origin: &str,
    ) {
        let cache = self.cache_or_create(name);
        let config = *cache.config.read();
        let origin: Arc<str> = Arc::from(origin);
        let now = Instant::now();

        let mut inner = cache.inner.write();
        cache.install(&mut inner, &config, key.into(), value, ttl_override, &origin, now);
        cache.publish_gauges(&inner);
    }

    /// Inserts a batch of entries under a single acquisition of the cache
    /// lock. Each entry individually runs the eviction precondition.
    pub fn put_all(
        &self,
        name: &str,
        entries: Vec<(String, Arc<[u8]>)>,
        ttl_override: Option<Duration>,
        origin: &str,
    ) {
        let cache = self.cache_or_create(name);
        let config = *cache.config.read();
        let origin: Arc<str> = Arc::from(origin);
        let now = Instant::now();

        let mut inner = cache.inner.write();
        for (key, value) in entries {
            cache.install(&mut inner, &config, key, value, ttl_override, &origin, now);
        }
        cache.publish_gauges(&inner);
    }

    /// Looks up a key, recording a hit or a miss.
    ///
    /// Expired entries are removed on access and count as misses. An unknown
    /// cache is a miss, not an error.
    pub fn get(&self, name: &str, key: &str) -> Option<Arc<[u8]>> {
        let cache = self.lookup_cache(name)?;
        cache.lookup(key, true)
    }

    /// Lookup that records hits but stays silent on misses.
    ///
    /// Used by the load path so a coalesced burst of loaders counts as a
    /// single miss rather than one per waiter.
    pub fn probe(&self, name: &str, key: &str) -> Option<Arc<[u8]>> {
        let cache = self.lookup_cache(name)?;
        cache.lookup(key, false)
    }

    /// Removes one entry. Returns whether an entry was present.
    pub fn invalidate(&self, name: &str, key: &str) -> bool {
        let cache = match self.lookup_cache(name) {
            Some(cache) => cache,
            None => return false,
        };
        let mut inner = cache.inner.write();
        let removed = inner.entries.remove(key);
        if let Some(entry) = &removed {
            inner.memory_bytes = inner
                .memory_bytes
                .saturating_sub(sizer::entry_footprint(key, entry.value.len()));
        }
        cache.publish_gauges(&inner);
        removed.is_some()
    }

    /// Removes every entry of a cache. Returns the number removed.
    pub fn invalidate_all(&self, name: &str) -> usize {
        let cache = match self.lookup_cache(name) {
            Some(cache) => cache,
            None => return 0,
        };
        let mut inner = cache.inner.write();
        let removed = inner.entries.len();
        inner.entries.clear();
        inner.memory_bytes = 0;
        cache.publish_gauges(&inner);
        removed
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn invalidate_by_prefix(&self, name: &str, prefix: &str) -> usize {
        let cache = match self.lookup_cache(name) {
            Some(cache) => cache,
            None => return 0,
        };
        let mut inner = cache.inner.write();
        let victims: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &victims {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_bytes = inner
                    .memory_bytes
                    .saturating_sub(sizer::entry_footprint(key, entry.value.len()));
            }
        }
        cache.publish_gauges(&inner);
        victims.len()
    }

    /// Sorted snapshot of keys, optionally restricted to a prefix.
    pub fn keys(&self, name: &str, prefix: Option<&str>) -> Vec<String> {
        let cache = match self.lookup_cache(name) {
            Some(cache) => cache,
            None => return Vec::new(),
        };
        let inner = cache.inner.read();
        let mut keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|key| prefix.map_or(true, |p| key.starts_with(p)))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Point-in-time statistics; zeroed for caches that do not exist.
    pub fn stats(&self, name: &str) -> StatsSnapshot {
        match self.lookup_cache(name) {
            Some(cache) => cache.stats.snapshot(),
            None => StatsSnapshot::empty(),
        }
    }

    /// Configuration of a cache, if it exists.
    pub fn config_of(&self, name: &str) -> Option<CacheConfig> {
        self.lookup_cache(name).map(|cache| *cache.config.read())
    }

    /// Sorted names of all caches created so far.
    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().keys().cloned().collect();
        names.sort();
        names
    }

    fn lookup_cache(&self, name: &str) -> Option<Arc<NamedCache>> {
        self.caches.read().get(name).map(Arc::clone)
    }

    fn cache_or_create(&self, name: &str) -> Arc<NamedCache> {
        if let Some(cache) = self.caches.read().get(name) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write();
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(NamedCache::new(CacheConfig::default()))),
        )
    }
}

impl NamedCache {
    fn new(config: CacheConfig) -> Self {
        NamedCache {
            config: RwLock::new(config),
            inner: RwLock::new(CacheInner {
                entries: HashMap::default(),
                memory_bytes: 0,
                epoch: Instant::now(),
            }),
            stats: CacheStats::new(),
        }
    }

    /// Looks up one key under the write lock, touching it on a hit and
    /// removing it on expiry. `count_miss` controls miss accounting.
    fn lookup(&self, key: &str, count_miss: bool) -> Option<Arc<[u8]>> {
        let now = Instant::now();
        let mut inner = self.inner.write();

        let expired = match inner.entries.get(key) {
            None => {
                if count_miss {
                    self.stats.record_miss();
                }
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_bytes = inner
                    .memory_bytes
                    .saturating_sub(sizer::entry_footprint(key, entry.value.len()));
            }
            self.publish_gauges(&inner);
            if count_miss {
                self.stats.record_miss();
            }
            return None;
        }

        let value = inner.entries.get_mut(key).map(|entry| {
            entry.touch(now);
            Arc::clone(&entry.value)
        });
        if value.is_some() {
            self.stats.record_hit();
        }
        value
    }

    /// Runs the eviction precondition and installs one entry.
    fn install(
        &self,
        inner: &mut CacheInner,
        config: &CacheConfig,
        key: String,
        value: Arc<[u8]>,
        ttl_override: Option<Duration>,
        origin: &Arc<str>,
        now: Instant,
    ) {
        self.evict_precondition(inner, config, now);

        let ttl = ttl_override.unwrap_or(config.ttl);
        let footprint = sizer::entry_footprint(&key, value.len());
        let entry = CacheEntry::new(value, ttl, Arc::clone(origin), now);
        if let Some(old) = inner.entries.insert(key.clone(), entry) {
            inner.memory_bytes = inner
                .memory_bytes
                .saturating_sub(sizer::entry_footprint(&key, old.value.len()));
        }
        inner.memory_bytes += footprint;
    }

    /// Before a put: sweep expired entries, then enforce the entry and
    /// memory budgets by policy.
    fn evict_precondition(&self, inner: &mut CacheInner, config: &CacheConfig, now: Instant) {
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_bytes = inner
                    .memory_bytes
                    .saturating_sub(sizer::entry_footprint(key, entry.value.len()));
            }
        }

        if inner.entries.len() >= config.max_entries {
            self.evict(inner, config.eviction_policy, 1);
        }
        if inner.memory_bytes >= config.memory_cap_bytes {
            let batch = sizer::memory_eviction_batch(inner.entries.len());
            self.evict(inner, config.eviction_policy, batch);
        }
    }

    /// Evicts up to `count` entries chosen by `policy`.
    fn evict(&self, inner: &mut CacheInner, policy: EvictionPolicy, count: usize) {
        let victims = select_victims(inner, policy, count);
        for key in victims {
            if let Some(entry) = inner.entries.remove(&key) {
                inner.memory_bytes = inner
                    .memory_bytes
                    .saturating_sub(sizer::entry_footprint(&key, entry.value.len()));
                self.stats.record_eviction(policy);
                debug!(key = %key, policy = policy.as_str(), "evicted cache entry");
            }
        }
    }

    fn publish_gauges(&self, inner: &CacheInner) {
        self.stats
            .set_gauges(inner.entries.len() as u64, inner.memory_bytes);
    }
}

/// Selects the `count` entries with the smallest (rank, key) pairs.
///
/// Uses a bounded max-heap so evicting k of n entries is O(n log k); the key
/// participates in the ordering to make ties deterministic.
fn select_victims(inner: &CacheInner, policy: EvictionPolicy, count: usize) -> Vec<String> {
    if count == 0 || inner.entries.is_empty() {
        return Vec::new();
    }

    let mut heap: BinaryHeap<(EvictionRank, String)> = BinaryHeap::with_capacity(count + 1);
    for (key, entry) in inner.entries.iter() {
        let rank = rank_of(policy, entry, inner.epoch);
        if heap.len() == count {
            // Skip entries that cannot beat the current worst candidate.
            if let Some((top_rank, top_key)) = heap.peek() {
                if (&rank, key.as_str()) >= (top_rank, top_key.as_str()) {
                    continue;
                }
            }
        }
        heap.push((rank, key.clone()));
        if heap.len() > count {
            heap.pop();
        }
    }

    heap.into_iter().map(|(_, key)| key).collect()
}

fn rank_of(policy: EvictionPolicy, entry: &CacheEntry, epoch: Instant) -> EvictionRank {
    match policy {
        EvictionPolicy::Lru => {
            EvictionRank::Time(entry.last_accessed.saturating_duration_since(epoch))
        }
        EvictionPolicy::Lfu => EvictionRank::Count(entry.access_count),
        EvictionPolicy::TtlOnly => {
            EvictionRank::Time(entry.expires_at.saturating_duration_since(epoch))
        }
    }
}
