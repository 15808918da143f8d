//! # MeshCache Cluster Plane
//!
//! Provide the pieces that keep replicas coherent across the TCP mesh:
//! the consistent-hash ring, peer membership with failure detection, the
//! framed transport (pooled sender and inbound listener), and the
//! coordinator that links transport to the store.

pub mod breaker;
pub mod coordinator;
pub mod membership;
pub mod ring;
pub mod sender;
pub mod server;

pub use coordinator::{Coordinator, DispatchMode};
pub use membership::{ClusterView, Membership, MembershipConfig, PeerStatus};
pub use ring::HashRing;
pub use sender::{PeerSender, SenderConfig};
pub use server::{ListenerConfig, MeshListener};
