//! # Cache Configuration Types
//!
//! Per-named-cache configuration shared by the store, the coordinator, and
//! the node configuration surface. Caches are created lazily with
//! `CacheConfig::default()` and may be reconfigured at any time without
//! dropping existing entries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Eviction policy applied when a cache is over its entry or memory budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvictionPolicy {
    /// Evict the entry with the oldest last-access timestamp.
    Lru,
    /// Evict the entry with the smallest access count.
    Lfu,
    /// Evict the entry closest to its expiration.
    TtlOnly,
}

impl EvictionPolicy {
    /// Stable name used to tag eviction counters.
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
            EvictionPolicy::Lfu => "lfu",
            EvictionPolicy::TtlOnly => "ttl_only",
        }
    }
}

/// Coherence discipline applied to peers after a local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationMode {
    /// Keep mutations local; no peer traffic on `put`.
    None,
    /// Tell peers to drop their copy; they re-load on their own misses.
    Invalidate,
    /// Push the new value to peers directly.
    Replicate,
}

/// Configuration of one named cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheConfig {
    /// Default time-to-live applied when a put carries no override.
    pub ttl: Duration,
    /// Eviction policy for the entry and memory budgets.
    pub eviction_policy: EvictionPolicy,
    /// Maximum number of entries; enforced after every mutation.
    pub max_entries: usize,
    /// Memory budget in bytes; enforced best-effort on the next put.
    pub memory_cap_bytes: u64,
    /// Coherence mode for peer coordination.
    pub replication_mode: ReplicationMode,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            ttl: Duration::from_secs(300),
            eviction_policy: EvictionPolicy::Lru,
            max_entries: 10_000,
            memory_cap_bytes: 64 * 1024 * 1024,
            replication_mode: ReplicationMode::None,
        }
    }
}

impl CacheConfig {
    /// Rejects configurations that would disable the cache entirely.
    pub fn validate(&self) -> CacheResult<()> {
        if self.ttl.is_zero() {
            return Err(CacheError::InvalidConfig("ttl must be positive".to_string()));
        }
        if self.max_entries == 0 {
            return Err(CacheError::InvalidConfig(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        if self.memory_cap_bytes == 0 {
            return Err(CacheError::InvalidConfig(
                "memory_cap_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let mut config = CacheConfig::default();
        config.max_entries = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.memory_cap_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.ttl = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn policy_names_are_stable() {
        assert_eq!(EvictionPolicy::Lru.as_str(), "lru");
        assert_eq!(EvictionPolicy::Lfu.as_str(), "lfu");
        assert_eq!(EvictionPolicy::TtlOnly.as_str(), "ttl_only");
    }

    #[test]
    fn enums_deserialize_from_wire_names() {
        let policy: EvictionPolicy = serde_json::from_str("\"TTL_ONLY\"").unwrap();
        assert_eq!(policy, EvictionPolicy::TtlOnly);

        let mode: ReplicationMode = serde_json::from_str("\"INVALIDATE\"").unwrap();
        assert_eq!(mode, ReplicationMode::Invalidate);
    }
}
