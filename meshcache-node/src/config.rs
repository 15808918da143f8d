//! # Node Configuration
//!
//! Purpose: Load and validate the startup configuration: node identity,
//! communication port, heartbeat parameters, static peer discovery, and
//! per-cache sections with ISO-8601 TTLs.
//!
//! ## Design Principles
//! 1. **Fail Fast**: `validate()` rejects a broken configuration before
//!    the node binds anything; a node must not start half-configured.
//! 2. **Derived Identity**: When `node_id` is omitted it becomes
//!    `advertised_host:port` after the listener binds, which is exactly
//!    the name peers use to dial this node. That makes inbound heartbeat
//!    recognition a plain string comparison.
//! 3. **Defaults Everywhere**: Every field has a sensible default so an
//!    embedded single-node cache needs no file at all.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use meshcache_common::{CacheConfig, CacheError, CacheResult, EvictionPolicy, ReplicationMode};

/// Startup configuration for one cache node.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Unique node identifier. Defaults to `advertised_host:port` once the
    /// listener is bound.
    #[serde(default)]
    pub node_id: Option<String>,
    /// Host peers use to reach this node; part of the derived node id.
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,
    /// Mesh listener port; 0 binds an ephemeral port.
    #[serde(default)]
    pub communication_port: u16,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    /// Consecutive heartbeat failures before a peer is marked inactive.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// When set, coherence sends run inline and surface peer failures to
    /// the calling operation.
    #[serde(default)]
    pub sync_dispatch: bool,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Named cache sections, configured at startup.
    #[serde(default)]
    pub caches: BTreeMap<String, CacheSection>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: None,
            advertised_host: default_advertised_host(),
            communication_port: 0,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            sync_dispatch: false,
            discovery: DiscoveryConfig::default(),
            caches: BTreeMap::new(),
        }
    }
}

/// Peer discovery settings. Only static lists are supported.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_kind")]
    pub kind: String,
    /// Initial peer list, `host:port` each; all start in the active set.
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            kind: default_discovery_kind(),
            peers: Vec::new(),
        }
    }
}

/// One named cache section from the configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Default TTL as an ISO-8601 duration, e.g. `PT5M`.
    #[serde(default = "default_ttl")]
    pub ttl: String,
    #[serde(default = "default_eviction_policy")]
    pub eviction_policy: EvictionPolicy,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_memory_cap_mb")]
    pub memory_cap_mb: u64,
    #[serde(default = "default_replication_mode")]
    pub replication_mode: ReplicationMode,
}

impl Default for CacheSection {
    fn default() -> Self {
        CacheSection {
            ttl: default_ttl(),
            eviction_policy: default_eviction_policy(),
            max_entries: default_max_entries(),
            memory_cap_mb: default_memory_cap_mb(),
            replication_mode: default_replication_mode(),
        }
    }
}

impl CacheSection {
    /// Converts the file section into the store's configuration type.
    pub fn to_cache_config(&self) -> CacheResult<CacheConfig> {
        let config = CacheConfig {
            ttl: parse_iso8601_duration(&self.ttl)?,
            eviction_policy: self.eviction_policy,
            max_entries: self.max_entries,
            memory_cap_bytes: self.memory_cap_mb.saturating_mul(1024 * 1024),
            replication_mode: self.replication_mode,
        };
        config.validate()?;
        Ok(config)
    }
}

impl NodeConfig {
    /// Loads and validates a TOML configuration file.
    pub fn from_file(path: &str) -> CacheResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            CacheError::InvalidConfig(format!("cannot read config file '{path}': {err}"))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates TOML configuration content.
    pub fn from_toml_str(content: &str) -> CacheResult<Self> {
        let config: NodeConfig = toml::from_str(content)
            .map_err(|err| CacheError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the node must not start with.
    pub fn validate(&self) -> CacheResult<()> {
        if let Some(node_id) = &self.node_id {
            if node_id.trim().is_empty() {
                return Err(CacheError::InvalidConfig(
                    "node_id must not be empty".to_string(),
                ));
            }
        }
        if self.advertised_host.trim().is_empty() {
            return Err(CacheError::InvalidConfig(
                "advertised_host must not be empty".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(CacheError::InvalidConfig(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms <= self.heartbeat_interval_ms {
            return Err(CacheError::InvalidConfig(
                "heartbeat_timeout_ms must exceed heartbeat_interval_ms".to_string(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(CacheError::InvalidConfig(
                "failure_threshold must be positive".to_string(),
            ));
        }
        if self.discovery.kind != "static" {
            return Err(CacheError::InvalidConfig(format!(
                "unsupported discovery kind '{}'",
                self.discovery.kind
            )));
        }
        for peer in &self.discovery.peers {
            validate_peer_addr(peer)?;
        }
        for (name, section) in &self.caches {
            section.to_cache_config().map_err(|err| {
                CacheError::InvalidConfig(format!("cache '{name}': {err}"))
            })?;
        }
        Ok(())
    }

    /// Heartbeat interval as a duration.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout as a duration.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
}

/// Checks that a peer address looks like `host:port`.
pub fn validate_peer_addr(addr: &str) -> CacheResult<()> {
    let invalid = || {
        CacheError::InvalidConfig(format!("peer address '{addr}' is not host:port"))
    };
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            port.parse::<u16>().map_err(|_| invalid())?;
            Ok(())
        }
        _ => Err(invalid()),
    }
}

/// Parses an ISO-8601 duration (`PnDTnHnMnS`, fractional seconds allowed).
pub fn parse_iso8601_duration(text: &str) -> CacheResult<Duration> {
    let invalid = |reason: &str| {
        CacheError::InvalidConfig(format!("invalid ISO-8601 duration '{text}': {reason}"))
    };

    let upper = text.trim().to_ascii_uppercase();
    let body = upper
        .strip_prefix('P')
        .ok_or_else(|| invalid("missing leading 'P'"))?;
    if body.is_empty() {
        return Err(invalid("no components"));
    }

    let (date_part, time_part) = match body.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (body, None),
    };
    if let Some(time) = time_part {
        if time.is_empty() {
            return Err(invalid("'T' with no time components"));
        }
    }

    let mut seconds = 0.0f64;
    for (value, unit) in components(date_part).map_err(|reason| invalid(&reason))? {
        match unit {
            'D' => seconds += value * 86_400.0,
            other => return Err(invalid(&format!("unsupported date unit '{other}'"))),
        }
    }
    if let Some(time) = time_part {
        for (value, unit) in components(time).map_err(|reason| invalid(&reason))? {
            match unit {
                'H' => seconds += value * 3_600.0,
                'M' => seconds += value * 60.0,
                'S' => seconds += value,
                other => return Err(invalid(&format!("unsupported time unit '{other}'"))),
            }
        }
    }

    if !seconds.is_finite() || seconds < 0.0 {
        return Err(invalid("out of range"));
    }
    Ok(Duration::from_secs_f64(seconds))
}

/// Splits a duration segment into `(number, unit)` components.
fn components(part: &str) -> Result<Vec<(f64, char)>, String> {
    let mut out = Vec::new();
    let mut number = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else if ch.is_ascii_alphabetic() {
            if number.is_empty() {
                return Err(format!("unit '{ch}' without a number"));
            }
            let value: f64 = number
                .parse()
                .map_err(|_| format!("bad number '{number}'"))?;
            out.push((value, ch));
            number.clear();
        } else {
            return Err(format!("unexpected character '{ch}'"));
        }
    }
    if !number.is_empty() {
        return Err(format!("trailing number '{number}' without a unit"));
    }
    Ok(out)
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_discovery_kind() -> String {
    "static".to_string()
}

fn default_ttl() -> String {
    "PT5M".to_string()
}

fn default_eviction_policy() -> EvictionPolicy {
    EvictionPolicy::Lru
}

fn default_max_entries() -> usize {
    10_000
}

fn default_memory_cap_mb() -> u64 {
    64
}

fn default_replication_mode() -> ReplicationMode {
    ReplicationMode::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_durations() {
        assert_eq!(
            parse_iso8601_duration("PT10S").unwrap(),
            Duration::from_secs(10)
        );
        assert_eq!(
            parse_iso8601_duration("PT5M").unwrap(),
            Duration::from_secs(300)
        );
        assert_eq!(
            parse_iso8601_duration("PT1H30M").unwrap(),
            Duration::from_secs(5_400)
        );
        assert_eq!(
            parse_iso8601_duration("P1D").unwrap(),
            Duration::from_secs(86_400)
        );
        assert_eq!(
            parse_iso8601_duration("P2DT3H4M5S").unwrap(),
            Duration::from_secs(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5)
        );
    }

    #[test]
    fn parses_fractional_seconds_and_lowercase() {
        assert_eq!(
            parse_iso8601_duration("PT0.5S").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_iso8601_duration("pt2s").unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn rejects_malformed_durations() {
        for text in ["", "10s", "P", "PT", "PTXS", "PT5", "T10S", "P-1D"] {
            assert!(
                parse_iso8601_duration(text).is_err(),
                "'{text}' should be rejected"
            );
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn full_toml_round_trip() {
        let config = NodeConfig::from_toml_str(
            r#"
            node_id = "cache-a"
            advertised_host = "10.0.0.5"
            communication_port = 7400
            heartbeat_interval_ms = 1000
            heartbeat_timeout_ms = 3000
            failure_threshold = 4

            [discovery]
            kind = "static"
            peers = ["10.0.0.6:7400", "10.0.0.7:7400"]

            [caches.users]
            ttl = "PT10S"
            eviction_policy = "LRU"
            max_entries = 100
            memory_cap_mb = 16
            replication_mode = "INVALIDATE"

            [caches.sessions]
            ttl = "PT1H"
            eviction_policy = "TTL_ONLY"
            replication_mode = "REPLICATE"
            "#,
        )
        .unwrap();

        assert_eq!(config.node_id.as_deref(), Some("cache-a"));
        assert_eq!(config.discovery.peers.len(), 2);
        assert_eq!(config.failure_threshold, 4);

        let users = config.caches["users"].to_cache_config().unwrap();
        assert_eq!(users.ttl, Duration::from_secs(10));
        assert_eq!(users.replication_mode, ReplicationMode::Invalidate);
        assert_eq!(users.memory_cap_bytes, 16 * 1024 * 1024);

        let sessions = config.caches["sessions"].to_cache_config().unwrap();
        assert_eq!(sessions.eviction_policy, EvictionPolicy::TtlOnly);
        assert_eq!(sessions.max_entries, 10_000);
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let config = NodeConfig {
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 5_000,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_peer_addresses_are_rejected() {
        for peer in ["", "host", ":7400", "host:", "host:notaport", "host:99999"] {
            let config = NodeConfig {
                discovery: DiscoveryConfig {
                    kind: "static".to_string(),
                    peers: vec![peer.to_string()],
                },
                ..NodeConfig::default()
            };
            assert!(config.validate().is_err(), "'{peer}' should be rejected");
        }
    }

    #[test]
    fn unknown_discovery_kind_is_rejected() {
        let config = NodeConfig {
            discovery: DiscoveryConfig {
                kind: "multicast".to_string(),
                peers: Vec::new(),
            },
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_cache_section_is_rejected() {
        let result = NodeConfig::from_toml_str(
            r#"
            [caches.broken]
            ttl = "PT10S"
            max_entries = 0
            "#,
        );
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn empty_node_id_is_rejected() {
        let config = NodeConfig {
            node_id: Some("  ".to_string()),
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
