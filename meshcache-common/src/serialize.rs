//! # Value Serializer
//!
//! Purpose: Turn user values and wire message payloads into byte sequences
//! and back, with a version tag so the format can evolve.
//!
//! ## Design Principles
//! 1. **Self-Describing Body**: JSON round-trips maps, lists, primitives,
//!    and user records without an external schema.
//! 2. **Versioned Envelope**: One leading format byte gates decoding, so a
//!    future format change cannot be misread as data corruption.
//! 3. **Fail Fast**: Truncated or malformed input surfaces `Serialization`
//!    immediately; nothing is guessed.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, CacheResult};

/// Current serialization format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encodes a value as a version byte followed by its JSON body.
///
/// Deterministic per value; the result is what the store holds and what the
/// wire carries as payload bytes.
pub fn encode<T: Serialize>(value: &T) -> CacheResult<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    buf.push(FORMAT_VERSION);
    serde_json::to_writer(&mut buf, value)
        .map_err(|err| CacheError::Serialization(err.to_string()))?;
    Ok(buf)
}

/// Decodes a value previously produced by [`encode`].
///
/// Rejects empty input and unknown format versions before touching the body.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CacheResult<T> {
    let (version, body) = match bytes.split_first() {
        Some(parts) => parts,
        None => return Err(CacheError::Serialization("empty payload".to_string())),
    };
    if *version != FORMAT_VERSION {
        return Err(CacheError::Serialization(format!(
            "unsupported format version {version}"
        )));
    }
    serde_json::from_slice(body).map_err(|err| CacheError::Serialization(err.to_string()))
}
