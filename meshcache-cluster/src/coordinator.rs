//! # Coordinator
//!
//! Purpose: Link the store to the transport. Local mutations fan out as
//! peer messages; inbound messages mutate the store and membership without
//! ever re-emitting, which is what prevents invalidation loops.
//!
//! ## Design Principles
//! 1. **Local First**: The façade completes the local mutation before the
//!    coordinator is invoked; peer failures never undo local effects.
//! 2. **Async By Default**: Messages are queued to a dispatcher thread and
//!    failures are logged and swallowed; sync mode sends inline and
//!    surfaces the first failure.
//! 3. **No Re-Emission**: Inbound handlers touch the store directly and
//!    never produce outbound traffic.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use meshcache_common::wire::{
    HeartbeatMessage, InvalidationMessage, PeerMessage, ReplicationMessage,
};
use meshcache_common::{CacheResult, ReplicationMode};
use meshcache_store::CacheStore;

use crate::membership::Membership;
use crate::sender::PeerSender;

/// How outbound sends relate to the calling façade operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Queue sends to a background dispatcher and return immediately.
    #[default]
    Async,
    /// Send inline; the first peer failure propagates to the caller.
    Sync,
}

struct Envelope {
    peer: String,
    message: PeerMessage,
}

/// Bridges the store, membership, and transport.
pub struct Coordinator {
    node_id: Arc<str>,
    store: Arc<CacheStore>,
    membership: Arc<Membership>,
    sender: Arc<PeerSender>,
    mode: DispatchMode,
    outbound: Mutex<Option<mpsc::Sender<Envelope>>>,
    dispatcher: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Coordinator {
    /// Creates a coordinator; async mode starts the dispatcher thread.
    pub fn new(
        node_id: &str,
        store: Arc<CacheStore>,
        membership: Arc<Membership>,
        sender: Arc<PeerSender>,
        mode: DispatchMode,
    ) -> CacheResult<Self> {
        let (outbound, dispatcher) = match mode {
            DispatchMode::Sync => (None, None),
            DispatchMode::Async => {
                let (tx, rx) = mpsc::channel::<Envelope>();
                let dispatch_sender = Arc::clone(&sender);
                let handle = thread::Builder::new()
                    .name("meshcache-dispatch".to_string())
                    .spawn(move || {
                        for envelope in rx {
                            if let Err(err) =
                                dispatch_sender.send(&envelope.peer, &envelope.message)
                            {
                                warn!(
                                    peer = %envelope.peer,
                                    error = %err,
                                    "async peer send failed"
                                );
                            }
                        }
                    })?;
                (Some(tx), Some(handle))
            }
        };

        Ok(Coordinator {
            node_id: Arc::from(node_id),
            store,
            membership,
            sender,
            mode,
            outbound: Mutex::new(outbound),
            dispatcher: Mutex::new(dispatcher),
        })
    }

    /// This node's identifier, carried as `origin_node_id` on the wire.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Fans out the coherence message for a completed local put.
    ///
    /// INVALIDATE mode deliberately sends an invalidation, not the value:
    /// the local copy is canonical and peers re-load on their own misses.
    pub fn after_put(
        &self,
        cache: &str,
        key: &str,
        value: &Arc<[u8]>,
        ttl_override: Option<Duration>,
    ) -> CacheResult<()> {
        let config = match self.store.config_of(cache) {
            Some(config) => config,
            None => return Ok(()),
        };
        match config.replication_mode {
            ReplicationMode::None => Ok(()),
            ReplicationMode::Invalidate => {
                self.fan_out(PeerMessage::Invalidation(InvalidationMessage {
                    cache_name: cache.to_string(),
                    key: Some(key.to_string()),
                    origin_node_id: self.node_id.to_string(),
                    invalidate_all: false,
                }))
            }
            ReplicationMode::Replicate => {
                self.fan_out(PeerMessage::Replication(ReplicationMessage {
                    cache_name: cache.to_string(),
                    key: key.to_string(),
                    value: value.to_vec(),
                    ttl_ms: ttl_override.unwrap_or(config.ttl).as_millis() as u64,
                    origin_node_id: self.node_id.to_string(),
                }))
            }
        }
    }

    /// Fans out a single-key invalidation after a local invalidate.
    pub fn after_invalidate(&self, cache: &str, key: &str) -> CacheResult<()> {
        self.fan_out(PeerMessage::Invalidation(InvalidationMessage {
            cache_name: cache.to_string(),
            key: Some(key.to_string()),
            origin_node_id: self.node_id.to_string(),
            invalidate_all: false,
        }))
    }

    /// Fans out a full-cache invalidation after a local clear.
    pub fn after_invalidate_all(&self, cache: &str) -> CacheResult<()> {
        self.fan_out(PeerMessage::Invalidation(InvalidationMessage {
            cache_name: cache.to_string(),
            key: None,
            origin_node_id: self.node_id.to_string(),
            invalidate_all: true,
        }))
    }

    /// Pings every known peer, not only active ones, so inactive peers can
    /// recover. Outcomes are recorded by the sender.
    pub fn send_heartbeats(&self) {
        let message = PeerMessage::Heartbeat(HeartbeatMessage::new(self.node_id.as_ref()));
        for peer in self.membership.known_peers() {
            if let Err(err) = self.sender.send_once(&peer, &message) {
                debug!(peer = %peer, error = %err, "heartbeat send failed");
            }
        }
    }

    /// Applies one inbound message. Never emits outbound traffic.
    pub fn apply(&self, message: PeerMessage) -> CacheResult<()> {
        match message {
            PeerMessage::Invalidation(message) => {
                if message.invalidate_all {
                    let removed = self.store.invalidate_all(&message.cache_name);
                    debug!(
                        cache = %message.cache_name,
                        origin = %message.origin_node_id,
                        removed,
                        "applied remote invalidate-all"
                    );
                } else if let Some(key) = &message.key {
                    self.store.invalidate(&message.cache_name, key);
                    debug!(
                        cache = %message.cache_name,
                        key = %key,
                        origin = %message.origin_node_id,
                        "applied remote invalidation"
                    );
                }
                Ok(())
            }
            PeerMessage::Replication(message) => {
                // Last writer wins by local arrival order; the origin id is
                // informational and never suppresses application.
                let ttl = message.ttl();
                self.store.put(
                    &message.cache_name,
                    message.key,
                    Arc::from(message.value),
                    Some(ttl),
                    &message.origin_node_id,
                );
                Ok(())
            }
            PeerMessage::Heartbeat(message) => {
                self.membership
                    .observe_heartbeat(&message.node_id, message.timestamp_ms);
                Ok(())
            }
        }
    }

    /// Stops the async dispatcher and waits for queued sends to drain.
    pub fn shutdown(&self) {
        self.outbound.lock().take();
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
    }

    fn fan_out(&self, message: PeerMessage) -> CacheResult<()> {
        let peers = self.membership.active_peers();
        if peers.is_empty() {
            return Ok(());
        }

        match self.mode {
            DispatchMode::Async => {
                let outbound = self.outbound.lock();
                if let Some(tx) = outbound.as_ref() {
                    for peer in peers {
                        let _ = tx.send(Envelope {
                            peer,
                            message: message.clone(),
                        });
                    }
                }
                Ok(())
            }
            DispatchMode::Sync => {
                let mut first_error = None;
                for peer in peers {
                    if let Err(err) = self.sender.send(&peer, &message) {
                        warn!(peer = %peer, error = %err, "sync peer send failed");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
                match first_error {
                    None => Ok(()),
                    Some(err) => Err(err),
                }
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipConfig;
    use crate::sender::SenderConfig;
    use meshcache_common::CacheError;

    fn coordinator(mode: DispatchMode) -> (Coordinator, Arc<CacheStore>, Arc<Membership>) {
        let store = Arc::new(CacheStore::new());
        let membership = Arc::new(Membership::new("127.0.0.1:7400", MembershipConfig::default()));
        let sender = Arc::new(PeerSender::new(
            Arc::clone(&membership),
            SenderConfig {
                connect_timeout: Duration::from_millis(200),
                io_timeout: Duration::from_millis(200),
                retry_delay: Duration::from_millis(5),
                ..SenderConfig::default()
            },
        ));
        let coordinator = Coordinator::new(
            "127.0.0.1:7400",
            Arc::clone(&store),
            Arc::clone(&membership),
            sender,
            mode,
        )
        .unwrap();
        (coordinator, store, membership)
    }

    #[test]
    fn inbound_invalidation_removes_entry() {
        let (coordinator, store, _membership) = coordinator(DispatchMode::Async);
        store.put("c", "k", Arc::from(&b"v"[..]), None, "origin");

        coordinator
            .apply(PeerMessage::Invalidation(InvalidationMessage {
                cache_name: "c".to_string(),
                key: Some("k".to_string()),
                origin_node_id: "peer".to_string(),
                invalidate_all: false,
            }))
            .unwrap();

        assert!(store.get("c", "k").is_none());
    }

    #[test]
    fn inbound_invalidate_all_clears_cache() {
        let (coordinator, store, _membership) = coordinator(DispatchMode::Async);
        store.put("c", "k1", Arc::from(&b"v"[..]), None, "origin");
        store.put("c", "k2", Arc::from(&b"v"[..]), None, "origin");

        coordinator
            .apply(PeerMessage::Invalidation(InvalidationMessage {
                cache_name: "c".to_string(),
                key: None,
                origin_node_id: "peer".to_string(),
                invalidate_all: true,
            }))
            .unwrap();

        assert_eq!(store.stats("c").size, 0);
    }

    #[test]
    fn inbound_replication_installs_value_with_ttl() {
        let (coordinator, store, _membership) = coordinator(DispatchMode::Async);

        coordinator
            .apply(PeerMessage::Replication(ReplicationMessage {
                cache_name: "c".to_string(),
                key: "k".to_string(),
                value: b"payload".to_vec(),
                ttl_ms: 30,
                origin_node_id: "peer".to_string(),
            }))
            .unwrap();

        assert_eq!(&*store.get("c", "k").unwrap(), b"payload");
        std::thread::sleep(Duration::from_millis(60));
        assert!(store.get("c", "k").is_none());
    }

    #[test]
    fn inbound_heartbeat_recovers_peer() {
        let (coordinator, _store, membership) = coordinator(DispatchMode::Async);
        membership.add_peer("127.0.0.1:7401");
        for _ in 0..3 {
            membership.record_failure("127.0.0.1:7401");
        }
        assert!(!membership.is_active("127.0.0.1:7401"));

        coordinator
            .apply(PeerMessage::Heartbeat(HeartbeatMessage::new(
                "127.0.0.1:7401",
            )))
            .unwrap();
        assert!(membership.is_active("127.0.0.1:7401"));
    }

    #[test]
    fn fan_out_without_peers_is_a_no_op() {
        let (coordinator, store, _membership) = coordinator(DispatchMode::Sync);
        store.put("c", "k", Arc::from(&b"v"[..]), None, "origin");
        coordinator.after_invalidate("c", "k").unwrap();
    }

    #[test]
    fn sync_mode_surfaces_peer_failure() {
        let (coordinator, store, membership) = coordinator(DispatchMode::Sync);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);
        membership.add_peer(&dead);
        store.put("c", "k", Arc::from(&b"v"[..]), None, "origin");

        let result = coordinator.after_invalidate("c", "k");
        assert!(matches!(result, Err(CacheError::ClusterCommunication(_))));
    }

    #[test]
    fn put_in_none_mode_emits_nothing_even_with_peers() {
        let (coordinator, store, membership) = coordinator(DispatchMode::Sync);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);
        membership.add_peer(&dead);

        store.put("c", "k", Arc::from(&b"v"[..]), None, "origin");
        // Default cache config is mode NONE, so no send happens and no
        // error can surface even though the only peer is dead.
        let value: Arc<[u8]> = Arc::from(&b"v"[..]);
        coordinator.after_put("c", "k", &value, None).unwrap();
    }
}
