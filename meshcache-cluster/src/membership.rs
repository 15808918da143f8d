//! # Peer Membership
//!
//! Purpose: Track known and active peers, count consecutive heartbeat
//! failures, and expose the cluster view the admin surface reads.
//!
//! ## Design Principles
//! 1. **Single Map**: Known and active are one map plus a flag, so a peer
//!    can never be active without being known.
//! 2. **Two Clocks**: Staleness uses the monotonic clock; the admin view
//!    reports wall-clock milliseconds.
//! 3. **Recovery Path**: Any successful heartbeat reactivates a peer and
//!    zeroes its failure count, regardless of how long it was gone.

use std::time::{Duration, Instant};

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use meshcache_common::wire::epoch_ms;

/// Failure-detection parameters.
#[derive(Debug, Clone, Copy)]
pub struct MembershipConfig {
    /// Interval between heartbeat rounds.
    pub heartbeat_interval: Duration,
    /// Age past which a peer's last heartbeat counts as stale.
    pub heartbeat_timeout: Duration,
    /// Consecutive failures before a peer is marked inactive.
    pub failure_threshold: u32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        MembershipConfig {
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct PeerHealth {
    last_heartbeat: Instant,
    last_heartbeat_ms: i64,
    consecutive_failures: u32,
    active: bool,
}

/// Membership state for one node.
#[derive(Debug)]
pub struct Membership {
    node_id: String,
    config: MembershipConfig,
    peers: RwLock<HashMap<String, PeerHealth>>,
}

impl Membership {
    /// Creates an empty membership view for `node_id`.
    pub fn new(node_id: impl Into<String>, config: MembershipConfig) -> Self {
        Membership {
            node_id: node_id.into(),
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// This node's identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Failure-detection parameters in effect.
    pub fn config(&self) -> MembershipConfig {
        self.config
    }

    /// Adds a peer address. Discovered peers start in the active set.
    pub fn add_peer(&self, addr: &str) {
        let mut peers = self.peers.write();
        peers.entry(addr.to_string()).or_insert_with(|| {
            info!(peer = %addr, "peer added");
            PeerHealth {
                last_heartbeat: Instant::now(),
                last_heartbeat_ms: epoch_ms(),
                consecutive_failures: 0,
                active: true,
            }
        });
    }

    /// Removes a peer entirely (operator action).
    pub fn remove_peer(&self, addr: &str) {
        if self.peers.write().remove(addr).is_some() {
            info!(peer = %addr, "peer removed");
        }
    }

    /// All peer addresses this node knows about.
    pub fn known_peers(&self) -> Vec<String> {
        let mut known: Vec<String> = self.peers.read().keys().cloned().collect();
        known.sort();
        known
    }

    /// Peers currently considered reachable.
    pub fn active_peers(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .peers
            .read()
            .iter()
            .filter(|(_, health)| health.active)
            .map(|(addr, _)| addr.clone())
            .collect();
        active.sort();
        active
    }

    /// Returns whether a peer is currently in the active set.
    pub fn is_active(&self, addr: &str) -> bool {
        self.peers
            .read()
            .get(addr)
            .map(|health| health.active)
            .unwrap_or(false)
    }

    /// Records a successful exchange with a peer, reactivating it.
    pub fn record_success(&self, addr: &str) {
        let mut peers = self.peers.write();
        if let Some(health) = peers.get_mut(addr) {
            if !health.active {
                info!(peer = %addr, "peer recovered");
            }
            health.active = true;
            health.consecutive_failures = 0;
            health.last_heartbeat = Instant::now();
            health.last_heartbeat_ms = epoch_ms();
        }
    }

    /// Records a failed exchange; marks the peer inactive at the threshold.
    pub fn record_failure(&self, addr: &str) {
        let mut peers = self.peers.write();
        if let Some(health) = peers.get_mut(addr) {
            health.consecutive_failures = health.consecutive_failures.saturating_add(1);
            if health.active && health.consecutive_failures >= self.config.failure_threshold {
                health.active = false;
                warn!(
                    peer = %addr,
                    failures = health.consecutive_failures,
                    "peer marked inactive"
                );
            }
        }
    }

    /// Handles an inbound heartbeat. The sender is recognized only when its
    /// node id equals a known peer address (`host:port`).
    pub fn observe_heartbeat(&self, node_id: &str, timestamp_ms: i64) {
        if !self.peers.read().contains_key(node_id) {
            debug!(sender = %node_id, "heartbeat from unknown peer ignored");
            return;
        }
        debug!(sender = %node_id, timestamp_ms, "heartbeat observed");
        self.record_success(node_id);
    }

    /// Marks peers inactive whose last heartbeat is older than the timeout.
    ///
    /// Runs every `heartbeat_timeout / 2`; failure counters are left to the
    /// active probing path.
    pub fn sweep_stale(&self) {
        let now = Instant::now();
        let mut peers = self.peers.write();
        for (addr, health) in peers.iter_mut() {
            if health.active
                && now.duration_since(health.last_heartbeat) > self.config.heartbeat_timeout
            {
                health.active = false;
                warn!(peer = %addr, "peer heartbeat stale, marked inactive");
            }
        }
    }

    /// Snapshot of the membership state for the admin surface.
    pub fn view(&self) -> ClusterView {
        let peers = self.peers.read();
        let mut statuses: Vec<PeerStatus> = peers
            .iter()
            .map(|(addr, health)| PeerStatus {
                addr: addr.clone(),
                active: health.active,
                last_heartbeat_ms: health.last_heartbeat_ms,
                consecutive_failures: health.consecutive_failures,
            })
            .collect();
        statuses.sort_by(|a, b| a.addr.cmp(&b.addr));

        ClusterView {
            node_id: self.node_id.clone(),
            known_peers: statuses.iter().map(|status| status.addr.clone()).collect(),
            active_peers: statuses
                .iter()
                .filter(|status| status.active)
                .map(|status| status.addr.clone())
                .collect(),
            peers: statuses,
        }
    }
}

/// Health of one peer as reported by `ClusterView`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub addr: String,
    pub active: bool,
    pub last_heartbeat_ms: i64,
    pub consecutive_failures: u32,
}

/// Point-in-time membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterView {
    pub node_id: String,
    pub known_peers: Vec<String>,
    pub active_peers: Vec<String>,
    pub peers: Vec<PeerStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> Membership {
        Membership::new("127.0.0.1:7400", MembershipConfig::default())
    }

    #[test]
    fn added_peers_start_active() {
        let membership = membership();
        membership.add_peer("127.0.0.1:7401");
        assert_eq!(membership.known_peers(), vec!["127.0.0.1:7401"]);
        assert_eq!(membership.active_peers(), vec!["127.0.0.1:7401"]);
    }

    #[test]
    fn failures_below_threshold_keep_peer_active() {
        let membership = membership();
        membership.add_peer("p:1");
        membership.record_failure("p:1");
        membership.record_failure("p:1");
        assert!(membership.is_active("p:1"));
    }

    #[test]
    fn peer_goes_inactive_at_failure_threshold() {
        let membership = membership();
        membership.add_peer("p:1");
        for _ in 0..3 {
            membership.record_failure("p:1");
        }
        assert!(!membership.is_active("p:1"));
        assert_eq!(membership.known_peers(), vec!["p:1"]);
    }

    #[test]
    fn success_reactivates_and_resets_failures() {
        let membership = membership();
        membership.add_peer("p:1");
        for _ in 0..5 {
            membership.record_failure("p:1");
        }
        membership.record_success("p:1");
        assert!(membership.is_active("p:1"));
        assert_eq!(membership.view().peers[0].consecutive_failures, 0);
    }

    #[test]
    fn stale_sweep_marks_peer_inactive() {
        let config = MembershipConfig {
            heartbeat_interval: Duration::from_millis(10),
            heartbeat_timeout: Duration::from_millis(30),
            failure_threshold: 3,
        };
        let membership = Membership::new("self", config);
        membership.add_peer("p:1");
        std::thread::sleep(Duration::from_millis(60));
        membership.sweep_stale();
        assert!(!membership.is_active("p:1"));
    }

    #[test]
    fn heartbeat_from_unknown_sender_is_ignored() {
        let membership = membership();
        membership.observe_heartbeat("stranger:1", epoch_ms());
        assert!(membership.known_peers().is_empty());
    }

    #[test]
    fn heartbeat_from_known_sender_recovers_it() {
        let membership = membership();
        membership.add_peer("p:1");
        for _ in 0..4 {
            membership.record_failure("p:1");
        }
        assert!(!membership.is_active("p:1"));

        membership.observe_heartbeat("p:1", epoch_ms());
        assert!(membership.is_active("p:1"));
    }

    #[test]
    fn view_reports_known_and_active_separately() {
        let membership = membership();
        membership.add_peer("p:1");
        membership.add_peer("p:2");
        for _ in 0..3 {
            membership.record_failure("p:2");
        }

        let view = membership.view();
        assert_eq!(view.known_peers, vec!["p:1", "p:2"]);
        assert_eq!(view.active_peers, vec!["p:1"]);
        assert_eq!(view.peers[1].consecutive_failures, 3);
    }

    #[test]
    fn removed_peer_leaves_both_sets() {
        let membership = membership();
        membership.add_peer("p:1");
        membership.remove_peer("p:1");
        assert!(membership.known_peers().is_empty());
        assert!(membership.active_peers().is_empty());
    }
}
