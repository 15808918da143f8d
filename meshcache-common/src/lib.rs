//! # MeshCache Shared Types
//!
//! Provide the error taxonomy, cache configuration types, the versioned
//! value serializer, and the framed wire protocol shared by every
//! MeshCache crate.

pub mod error;
pub mod serialize;
pub mod types;
pub mod wire;

pub use error::{CacheError, CacheResult};
pub use types::{CacheConfig, EvictionPolicy, ReplicationMode};
pub use wire::{
    HeartbeatMessage, InvalidationMessage, MessageType, PeerMessage, ReplicationMessage,
};
