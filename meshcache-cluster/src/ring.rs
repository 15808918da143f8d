//! # Consistent-Hash Ring
//!
//! Purpose: Map keys to node ids with virtual nodes so membership changes
//! move only a small fraction of the key space.
//!
//! ## Design Principles
//! 1. **Ordered Points**: A `BTreeMap` gives O(log n) ceiling lookups via
//!    `range(hash..)` and a cheap wrap to the first point.
//! 2. **Virtual Nodes**: 150 points per physical node smooth the
//!    distribution; vnode keys are `"{node_id}#{index}"`.
//! 3. **Reader Concurrency**: Lookups share a read lock; add/remove take
//!    the write lock, so readers observe the pre- or post-change ring,
//!    never a torn view.
//!
//! The ring position of a key is the first 8 bytes of its MD5 digest,
//! interpreted big-endian.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Virtual nodes per physical node.
pub const VIRTUAL_NODES: usize = 150;

/// Thread-safe consistent-hash ring.
#[derive(Debug, Default)]
pub struct HashRing {
    inner: RwLock<RingInner>,
}

#[derive(Debug, Default)]
struct RingInner {
    /// Ring point -> owning node id.
    points: BTreeMap<u64, Arc<str>>,
    /// Distinct node ids currently on the ring.
    nodes: Vec<Arc<str>>,
}

impl HashRing {
    /// Creates an empty ring.
    pub fn new() -> Self {
        HashRing::default()
    }

    /// Adds a node and its virtual nodes. No-op if already present.
    pub fn add_node(&self, node_id: &str) {
        let mut inner = self.inner.write();
        if inner.nodes.iter().any(|node| node.as_ref() == node_id) {
            return;
        }
        let id: Arc<str> = Arc::from(node_id);
        for index in 0..VIRTUAL_NODES {
            let point = ring_point(&format!("{node_id}#{index}"));
            inner.points.insert(point, Arc::clone(&id));
        }
        inner.nodes.push(id);
    }

    /// Removes a node and all of its virtual nodes.
    pub fn remove_node(&self, node_id: &str) {
        let mut inner = self.inner.write();
        inner.points.retain(|_, owner| owner.as_ref() != node_id);
        inner.nodes.retain(|node| node.as_ref() != node_id);
    }

    /// Resolves the node owning `key`. Returns `None` iff the ring is empty.
    pub fn get_node(&self, key: &str) -> Option<String> {
        let hash = ring_point(key);
        let inner = self.inner.read();
        inner
            .points
            .range(hash..)
            .next()
            .or_else(|| inner.points.iter().next())
            .map(|(_, owner)| owner.to_string())
    }

    /// Walks the ring clockwise from `key`, collecting up to `count`
    /// distinct node ids in ring order.
    pub fn get_nodes(&self, key: &str, count: usize) -> Vec<String> {
        if count == 0 {
            return Vec::new();
        }
        let hash = ring_point(key);
        let inner = self.inner.read();

        let mut owners: Vec<String> = Vec::with_capacity(count);
        for (_, owner) in inner.points.range(hash..).chain(inner.points.range(..hash)) {
            if owners.iter().any(|seen| seen == owner.as_ref()) {
                continue;
            }
            owners.push(owner.to_string());
            if owners.len() == count {
                break;
            }
        }
        owners
    }

    /// Distinct node ids currently on the ring, sorted.
    pub fn all_nodes(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut nodes: Vec<String> = inner.nodes.iter().map(|node| node.to_string()).collect();
        nodes.sort();
        nodes
    }

    /// Number of physical nodes on the ring.
    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    /// Returns true when no nodes are on the ring.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reconciles the ring against a desired node set, adding missing nodes
    /// and removing extras.
    pub fn reconcile(&self, desired: &[String]) {
        let current = self.all_nodes();
        for node in desired {
            if !current.contains(node) {
                self.add_node(node);
            }
        }
        for node in &current {
            if !desired.contains(node) {
                self.remove_node(node);
            }
        }
    }
}

/// Ring position of a key: first 8 bytes of its MD5 digest, big-endian.
fn ring_point(key: &str) -> u64 {
    let digest = md5::compute(key.as_bytes());
    let bytes = digest.0;
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
