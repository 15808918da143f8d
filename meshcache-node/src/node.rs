//! # Cache Node Façade
//!
//! Purpose: Expose the public cache operations and own the whole engine:
//! store, hash ring, membership, transport, coordinator, and the
//! single-flight load path. The host application holds exactly one
//! `CacheNode` per process; there are no ambient singletons.
//!
//! ## Design Principles
//! 1. **Local First**: Every operation completes its local mutation before
//!    any peer communication starts; peer failures never undo local state.
//! 2. **Opaque Payloads**: The store holds serializer output; typed access
//!    goes through the `_as` helpers, so the store never sees user types.
//! 3. **Guarded Lifecycle**: After `shutdown` begins, every façade call is
//!    rejected with `ShuttingDown`; background tasks stop via flags the
//!    way the store's expiration sweeper would.
//!
//! ## Structure Overview
//!
//! ```text
//! CacheNode (Clone)
//!   └── NodeInner
//!         ├── store: CacheStore            (entries, TTL, eviction, stats)
//!         ├── ring: HashRing               (own id + active peers)
//!         ├── membership: Membership       (known/active peers)
//!         ├── sender: PeerSender           (pooled, retried, breaker-guarded)
//!         ├── coordinator: Coordinator     (outbound fan-out, inbound apply)
//!         ├── flights: FlightGroup         (single-flight per (cache, key))
//!         ├── runtime + listener           (inbound framed TCP)
//!         └── heartbeat / sweeper threads
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use meshcache_cluster::{
    ClusterView, Coordinator, DispatchMode, HashRing, ListenerConfig, Membership,
    MembershipConfig, MeshListener, PeerSender, SenderConfig,
};
use meshcache_common::error::BoxError;
use meshcache_common::{serialize, CacheConfig, CacheError, CacheResult};
use meshcache_store::{CacheStore, StatsSnapshot};

use crate::config::{validate_peer_addr, NodeConfig};
use crate::flight::FlightGroup;

/// Interval at which stoppable background loops re-check their stop flag.
const STOP_POLL: Duration = Duration::from_millis(25);

/// Handle to one embedded cache node.
#[derive(Clone)]
pub struct CacheNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    node_id: Arc<str>,
    advertised_addr: String,
    local_addr: SocketAddr,
    store: Arc<CacheStore>,
    ring: Arc<HashRing>,
    membership: Arc<Membership>,
    sender: Arc<PeerSender>,
    coordinator: Arc<Coordinator>,
    flights: FlightGroup,
    runtime: tokio::runtime::Runtime,
    listener: Mutex<Option<MeshListener>>,
    heartbeat: Mutex<Option<TaskHandle>>,
    sweeper: Mutex<Option<TaskHandle>>,
    prefetch_requests: AtomicU64,
    shutting_down: AtomicBool,
}

/// Stoppable background thread, joined on shutdown.
struct TaskHandle {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl TaskHandle {
    fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// One cache as reported by `list_caches`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheOverview {
    pub name: String,
    pub config: CacheConfig,
    pub stats: StatsSnapshot,
}

/// Paginated key snapshot from `list_keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyPage {
    pub keys: Vec<String>,
    pub total: usize,
    pub offset: usize,
}

impl CacheNode {
    /// Validates the configuration, binds the mesh listener, seeds
    /// discovery peers, and starts heartbeats.
    pub fn start(config: NodeConfig) -> CacheResult<CacheNode> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("meshcache-io")
            .enable_all()
            .build()?;

        let std_listener =
            std::net::TcpListener::bind(("0.0.0.0", config.communication_port))?;
        let local_addr = std_listener.local_addr()?;
        let advertised_addr = format!("{}:{}", config.advertised_host, local_addr.port());
        let node_id: Arc<str> = match &config.node_id {
            Some(id) => Arc::from(id.as_str()),
            None => Arc::from(advertised_addr.as_str()),
        };

        let store = Arc::new(CacheStore::new());
        for (name, section) in &config.caches {
            store.configure(name, section.to_cache_config()?)?;
        }

        let membership = Arc::new(Membership::new(
            node_id.as_ref(),
            MembershipConfig {
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout: config.heartbeat_timeout(),
                failure_threshold: config.failure_threshold,
            },
        ));
        let sender = Arc::new(PeerSender::new(
            Arc::clone(&membership),
            SenderConfig::default(),
        ));
        let mode = if config.sync_dispatch {
            DispatchMode::Sync
        } else {
            DispatchMode::Async
        };
        let coordinator = Arc::new(Coordinator::new(
            node_id.as_ref(),
            Arc::clone(&store),
            Arc::clone(&membership),
            Arc::clone(&sender),
            mode,
        )?);

        let listener = MeshListener::start(
            runtime.handle(),
            std_listener,
            Arc::clone(&coordinator),
            ListenerConfig::default(),
        )?;

        let ring = Arc::new(HashRing::new());
        ring.add_node(node_id.as_ref());
        for peer in &config.discovery.peers {
            membership.add_peer(peer);
            ring.add_node(peer);
        }

        let node = CacheNode {
            inner: Arc::new(NodeInner {
                node_id: Arc::clone(&node_id),
                advertised_addr,
                local_addr,
                store,
                ring,
                membership,
                sender,
                coordinator,
                flights: FlightGroup::new(),
                runtime,
                listener: Mutex::new(Some(listener)),
                heartbeat: Mutex::new(None),
                sweeper: Mutex::new(None),
                prefetch_requests: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
            }),
        };
        node.start_background_tasks()?;

        info!(node = %node_id, addr = %node.inner.local_addr, "cache node started");
        Ok(node)
    }

    /// This node's identifier.
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Address peers should dial, `host:port`.
    pub fn advertised_addr(&self) -> &str {
        &self.inner.advertised_addr
    }

    /// Address the mesh listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Creates or reconfigures a named cache, preserving its entries.
    pub fn configure_cache(&self, cache: &str, config: CacheConfig) -> CacheResult<()> {
        self.guard()?;
        self.inner.store.configure(cache, config)
    }

    /// Stores raw payload bytes and fans out per the cache's mode.
    pub fn put(
        &self,
        cache: &str,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.guard()?;
        let value: Arc<[u8]> = Arc::from(value);
        self.inner
            .store
            .put(cache, key, Arc::clone(&value), ttl, self.inner.node_id.as_ref());
        self.inner.coordinator.after_put(cache, key, &value, ttl)
    }

    /// Serializes and stores a typed value.
    pub fn put_as<T: Serialize>(
        &self,
        cache: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let bytes = serialize::encode(value)?;
        self.put(cache, key, bytes, ttl)
    }

    /// Stores a batch of raw entries under one store lock, then fans out
    /// one coherence message per entry.
    pub fn put_all(
        &self,
        cache: &str,
        entries: Vec<(String, Vec<u8>)>,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.guard()?;
        let entries: Vec<(String, Arc<[u8]>)> = entries
            .into_iter()
            .map(|(key, value)| (key, Arc::from(value)))
            .collect();
        self.inner.store.put_all(
            cache,
            entries.clone(),
            ttl,
            self.inner.node_id.as_ref(),
        );

        let mut first_error = None;
        for (key, value) in &entries {
            if let Err(err) = self.inner.coordinator.after_put(cache, key, value, ttl) {
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

    /// Fetches raw payload bytes, recording a hit or a miss.
    pub fn get(&self, cache: &str, key: &str) -> CacheResult<Option<Arc<[u8]>>> {
        self.guard()?;
        Ok(self.inner.store.get(cache, key))
    }

    /// Fetches and decodes a typed value.
    pub fn get_as<T: DeserializeOwned>(&self, cache: &str, key: &str) -> CacheResult<Option<T>> {
        match self.get(cache, key)? {
            Some(bytes) => serialize::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the cached value or runs `loader` exactly once per
    /// concurrent burst, caching its result.
    ///
    /// Concurrent callers for the same (cache, key) block on the in-flight
    /// load and observe its outcome. A burst records one miss; parked
    /// callers are not counted. Loader failures surface as `LoadFailed`
    /// and are never cached.
    pub fn get_or_load<F>(
        &self,
        cache: &str,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> CacheResult<Arc<[u8]>>
    where
        F: FnOnce() -> Result<Vec<u8>, BoxError>,
    {
        self.guard()?;
        if let Some(value) = self.inner.store.probe(cache, key) {
            return Ok(value);
        }

        let mut original: Option<BoxError> = None;
        let result = self.inner.flights.execute(cache, key, || {
            // Re-check after winning the flight: another burst may have
            // completed between the fast path and here.
            if let Some(value) = self.inner.store.get(cache, key) {
                return Ok(value);
            }
            match loader() {
                Ok(bytes) => {
                    let value: Arc<[u8]> = Arc::from(bytes);
                    self.inner.store.put(
                        cache,
                        key,
                        Arc::clone(&value),
                        ttl,
                        self.inner.node_id.as_ref(),
                    );
                    if let Err(err) = self.inner.coordinator.after_put(cache, key, &value, ttl) {
                        warn!(cache, key, error = %err, "post-load fan-out failed");
                    }
                    Ok(value)
                }
                Err(err) => {
                    let message = err.to_string();
                    original = Some(err);
                    Err(message)
                }
            }
        });

        result.map_err(|message| CacheError::LoadFailed {
            cache: cache.to_string(),
            key: key.to_string(),
            source: original.take().unwrap_or_else(|| message.into()),
        })
    }

    /// Typed `get_or_load`: the loader produces a value, which is encoded
    /// for storage and decoded on the way out.
    pub fn get_or_load_as<T, F>(
        &self,
        cache: &str,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, BoxError>,
    {
        let bytes = self.get_or_load(cache, key, ttl, || {
            let value = loader()?;
            serialize::encode(&value).map_err(|err| Box::new(err) as BoxError)
        })?;
        serialize::decode(&bytes)
    }

    /// Removes one entry locally, then tells every active peer to do the
    /// same.
    pub fn invalidate(&self, cache: &str, key: &str) -> CacheResult<()> {
        self.guard()?;
        self.inner.store.invalidate(cache, key);
        self.inner.coordinator.after_invalidate(cache, key)
    }

    /// Clears a cache locally, then tells every active peer to do the same.
    pub fn invalidate_all(&self, cache: &str) -> CacheResult<()> {
        self.guard()?;
        self.inner.store.invalidate_all(cache);
        self.inner.coordinator.after_invalidate_all(cache)
    }

    /// Removes entries by key prefix on this node only.
    pub fn invalidate_by_prefix(&self, cache: &str, prefix: &str) -> CacheResult<usize> {
        self.guard()?;
        Ok(self.inner.store.invalidate_by_prefix(cache, prefix))
    }

    /// Statistics for one cache.
    pub fn stats(&self, cache: &str) -> CacheResult<StatsSnapshot> {
        self.guard()?;
        Ok(self.inner.store.stats(cache))
    }

    /// Sorted key snapshot, optionally restricted to a prefix.
    pub fn keys(&self, cache: &str, prefix: Option<&str>) -> CacheResult<Vec<String>> {
        self.guard()?;
        Ok(self.inner.store.keys(cache, prefix))
    }

    /// Best-effort prefetch hook: records the request and returns.
    ///
    /// Actual background loading needs a per-cache loader registry, which
    /// is the host application's concern.
    pub fn prefetch(&self, cache: &str, keys: &[String]) -> CacheResult<()> {
        self.guard()?;
        self.inner
            .prefetch_requests
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        info!(cache, count = keys.len(), "prefetch requested");
        Ok(())
    }

    /// Total keys ever passed to `prefetch`.
    pub fn prefetch_requests(&self) -> u64 {
        self.inner.prefetch_requests.load(Ordering::Relaxed)
    }

    /// Every cache with its configuration and statistics.
    pub fn list_caches(&self) -> CacheResult<Vec<CacheOverview>> {
        self.guard()?;
        Ok(self
            .inner
            .store
            .cache_names()
            .into_iter()
            .map(|name| {
                let config = self
                    .inner
                    .store
                    .config_of(&name)
                    .unwrap_or_default();
                let stats = self.inner.store.stats(&name);
                CacheOverview { name, config, stats }
            })
            .collect())
    }

    /// Paginated key snapshot for the admin surface.
    pub fn list_keys(
        &self,
        cache: &str,
        prefix: Option<&str>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> CacheResult<KeyPage> {
        self.guard()?;
        let all = self.inner.store.keys(cache, prefix);
        let total = all.len();
        let offset = offset.unwrap_or(0).min(total);
        let end = match limit {
            Some(limit) => (offset + limit).min(total),
            None => total,
        };
        Ok(KeyPage {
            keys: all[offset..end].to_vec(),
            total,
            offset,
        })
    }

    /// Membership snapshot: known peers, active peers, per-peer health.
    pub fn cluster_view(&self) -> CacheResult<ClusterView> {
        self.guard()?;
        Ok(self.inner.membership.view())
    }

    /// Ring owner of a key across this node and its active peers.
    pub fn owner_of(&self, key: &str) -> CacheResult<Option<String>> {
        self.guard()?;
        Ok(self.inner.ring.get_node(key))
    }

    /// Adds a peer (operator action); it starts in the active set.
    pub fn add_peer(&self, addr: &str) -> CacheResult<()> {
        self.guard()?;
        validate_peer_addr(addr)?;
        self.inner.membership.add_peer(addr);
        self.inner.ring.add_node(addr);
        Ok(())
    }

    /// Removes a peer (operator action) and closes its pooled socket.
    pub fn remove_peer(&self, addr: &str) -> CacheResult<()> {
        self.guard()?;
        self.inner.membership.remove_peer(addr);
        self.inner.ring.remove_node(addr);
        self.inner.sender.drop_peer(addr);
        Ok(())
    }

    /// Stops serving: rejects new operations, stops heartbeats and the
    /// listener (with its grace period), drains the dispatcher, and closes
    /// pooled sockets. Idempotent.
    pub fn shutdown(&self) -> CacheResult<()> {
        self.inner.shutdown_internal();
        Ok(())
    }

    fn guard(&self) -> CacheResult<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(CacheError::ShuttingDown);
        }
        Ok(())
    }

    fn start_background_tasks(&self) -> CacheResult<()> {
        let config = self.inner.membership.config();

        let heartbeat = {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let coordinator = Arc::clone(&self.inner.coordinator);
            let membership = Arc::clone(&self.inner.membership);
            let ring = Arc::clone(&self.inner.ring);
            let node_id = Arc::clone(&self.inner.node_id);
            let interval = config.heartbeat_interval;
            let join = thread::Builder::new()
                .name("meshcache-heartbeat".to_string())
                .spawn(move || {
                    while !stop_flag.load(Ordering::Acquire) {
                        coordinator.send_heartbeats();
                        sync_ring(&ring, &node_id, &membership);
                        sleep_with_stop(&stop_flag, interval);
                    }
                })?;
            TaskHandle {
                stop,
                join: Some(join),
            }
        };
        *self.inner.heartbeat.lock() = Some(heartbeat);

        let sweeper = {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let membership = Arc::clone(&self.inner.membership);
            let ring = Arc::clone(&self.inner.ring);
            let node_id = Arc::clone(&self.inner.node_id);
            let period = config.heartbeat_timeout / 2;
            let join = thread::Builder::new()
                .name("meshcache-sweeper".to_string())
                .spawn(move || {
                    loop {
                        sleep_with_stop(&stop_flag, period);
                        if stop_flag.load(Ordering::Acquire) {
                            break;
                        }
                        membership.sweep_stale();
                        sync_ring(&ring, &node_id, &membership);
                    }
                })?;
            TaskHandle {
                stop,
                join: Some(join),
            }
        };
        *self.inner.sweeper.lock() = Some(sweeper);

        Ok(())
    }
}

impl NodeInner {
    fn shutdown_internal(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(node = %self.node_id, "cache node shutting down");

        if let Some(task) = self.heartbeat.lock().take() {
            task.stop();
        }
        if let Some(task) = self.sweeper.lock().take() {
            task.stop();
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.stop(self.runtime.handle());
        }
        self.coordinator.shutdown();
        self.sender.close_all();
    }
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        self.shutdown_internal();
    }
}

impl std::fmt::Debug for CacheNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheNode")
            .field("node_id", &self.inner.node_id)
            .field("addr", &self.inner.local_addr)
            .finish()
    }
}

/// Keeps the ring equal to the union of the own id and the active peers.
fn sync_ring(ring: &HashRing, node_id: &Arc<str>, membership: &Membership) {
    let mut desired = membership.active_peers();
    desired.push(node_id.to_string());
    ring.reconcile(&desired);
}

/// Sleeps in short slices so shutdown stays prompt.
fn sleep_with_stop(stop: &AtomicBool, total: Duration) {
    let mut remaining = total;
    while !remaining.is_zero() {
        if stop.load(Ordering::Acquire) {
            return;
        }
        let slice = remaining.min(STOP_POLL);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}
