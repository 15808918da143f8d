//! # Error Taxonomy
//!
//! Purpose: Define the one error enum every MeshCache operation surfaces,
//! so callers match on kinds instead of crate-internal failure types.
//!
//! ## Design Principles
//! 1. **Kinds, Not Causes**: Variants mirror the externally visible failure
//!    classes; internal causes ride along as sources or messages.
//! 2. **Local First**: A peer-communication failure never undoes a local
//!    mutation, so `ClusterCommunication` only reaches callers in sync mode.
//! 3. **Fail Fast**: Configuration problems abort startup via `InvalidConfig`.

use thiserror::Error;

/// Result type used across the MeshCache crates.
pub type CacheResult<T> = Result<T, CacheError>;

/// Boxed error type accepted from user-supplied loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by MeshCache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// A user-supplied loader failed; the failed attempt is never cached.
    #[error("loader failed for cache '{cache}' key '{key}': {source}")]
    LoadFailed {
        /// Cache the load was issued against.
        cache: String,
        /// Key the load was issued for.
        key: String,
        /// Underlying loader failure.
        #[source]
        source: BoxError,
    },

    /// A value or wire payload could not be encoded or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A peer send failed after retries or was short-circuited by the breaker.
    #[error("cluster communication failed: {0}")]
    ClusterCommunication(String),

    /// The node configuration is invalid; the node must not start serving.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The node has begun shutting down; the operation was rejected.
    #[error("node is shutting down")]
    ShuttingDown,

    /// Transport-level IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_failed_reports_cache_and_key() {
        let err = CacheError::LoadFailed {
            cache: "users".to_string(),
            key: "u:1".to_string(),
            source: "backend down".into(),
        };
        let text = err.to_string();
        assert!(text.contains("users"));
        assert!(text.contains("u:1"));
        assert!(text.contains("backend down"));
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let err = CacheError::from(io);
        assert!(matches!(err, CacheError::Io(_)));
    }
}
