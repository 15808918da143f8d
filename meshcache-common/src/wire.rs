//! # Wire Protocol
//!
//! Purpose: Define the three inter-node message records and the framing
//! that carries them over TCP, plus the short acknowledgment frame.
//!
//! ## Design Principles
//! 1. **Length-Prefixed Frames**: Every request is fully delimited before
//!    decoding starts, so a slow peer can never wedge the parser.
//! 2. **Typed Dispatch**: The UTF-8 type discriminator selects the payload
//!    record; unknown types fail fast instead of being skipped.
//! 3. **Bounded Input**: Type and payload lengths are capped so garbage on
//!    the port is rejected after at most eight bytes.
//! 4. **Distinct Ack Framing**: Acks use a `u16` prefix so a misdirected
//!    request can never parse as an acknowledgment.
//!
//! ## Frame Layout
//!
//! ```text
//! Request:
//! +---------------+-----------+------------------+---------------+
//! | typeLen: u32  | type: UTF8| payloadLen: u32  | payload bytes |
//! +---------------+-----------+------------------+---------------+
//! (both integers big-endian)
//!
//! Ack:
//! +-------------+------------------+
//! | len: u16 BE | "OK" / "ERROR"   |
//! +-------------+------------------+
//! ```

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{CacheError, CacheResult};
use crate::serialize;

/// Maximum accepted length of the type discriminator.
pub const MAX_TYPE_LEN: usize = 64;

/// Maximum accepted payload length (16 MiB).
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Positive acknowledgment token.
pub const ACK_OK: &str = "OK";

/// Negative acknowledgment token.
pub const ACK_ERROR: &str = "ERROR";

/// Message type discriminator carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalidation,
    Replication,
    Heartbeat,
}

impl MessageType {
    /// UTF-8 discriminator written into the frame.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Invalidation => "INVALIDATION",
            MessageType::Replication => "REPLICATION",
            MessageType::Heartbeat => "HEARTBEAT",
        }
    }

    /// Parses a discriminator read from the wire.
    pub fn from_bytes(bytes: &[u8]) -> CacheResult<Self> {
        match bytes {
            b"INVALIDATION" => Ok(MessageType::Invalidation),
            b"REPLICATION" => Ok(MessageType::Replication),
            b"HEARTBEAT" => Ok(MessageType::Heartbeat),
            other => Err(CacheError::Serialization(format!(
                "unknown message type {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }
}

/// Tells peers to drop one key or a whole cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub cache_name: String,
    /// Single key to drop; `None` when `invalidate_all` is set.
    pub key: Option<String>,
    pub origin_node_id: String,
    pub invalidate_all: bool,
}

/// Pushes a new value to peers so they install it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessage {
    pub cache_name: String,
    pub key: String,
    /// Serializer output for the value; peers store it opaquely.
    pub value: Vec<u8>,
    /// Effective time-to-live in milliseconds.
    pub ttl_ms: u64,
    pub origin_node_id: String,
}

impl ReplicationMessage {
    /// Restores the carried time-to-live.
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Application-level liveness ping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub node_id: String,
    /// Sender clock at emission, epoch milliseconds.
    pub timestamp_ms: i64,
    pub message_type: String,
}

impl HeartbeatMessage {
    /// Builds a heartbeat stamped with the current wall clock.
    pub fn new(node_id: impl Into<String>) -> Self {
        HeartbeatMessage {
            node_id: node_id.into(),
            timestamp_ms: epoch_ms(),
            message_type: MessageType::Heartbeat.as_str().to_string(),
        }
    }
}

/// Current wall clock as epoch milliseconds.
pub fn epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as i64
}

/// One inter-node message, ready for framing or dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    Invalidation(InvalidationMessage),
    Replication(ReplicationMessage),
    Heartbeat(HeartbeatMessage),
}

impl PeerMessage {
    /// Wire discriminator for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            PeerMessage::Invalidation(_) => MessageType::Invalidation,
            PeerMessage::Replication(_) => MessageType::Replication,
            PeerMessage::Heartbeat(_) => MessageType::Heartbeat,
        }
    }

    /// Serializer encoding of the payload record.
    pub fn encode_payload(&self) -> CacheResult<Vec<u8>> {
        match self {
            PeerMessage::Invalidation(message) => serialize::encode(message),
            PeerMessage::Replication(message) => serialize::encode(message),
            PeerMessage::Heartbeat(message) => serialize::encode(message),
        }
    }

    /// Decodes a payload for a known message type.
    pub fn decode(kind: MessageType, payload: &[u8]) -> CacheResult<Self> {
        match kind {
            MessageType::Invalidation => {
                serialize::decode(payload).map(PeerMessage::Invalidation)
            }
            MessageType::Replication => serialize::decode(payload).map(PeerMessage::Replication),
            MessageType::Heartbeat => serialize::decode(payload).map(PeerMessage::Heartbeat),
        }
    }
}

/// Encodes a full request frame for one message.
pub fn encode_frame(message: &PeerMessage) -> CacheResult<Vec<u8>> {
    let kind = message.message_type().as_str().as_bytes();
    let payload = message.encode_payload()?;

    let mut out = Vec::with_capacity(8 + kind.len() + payload.len());
    out.extend_from_slice(&(kind.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` while the frame is still incomplete; consumed bytes
/// are removed from `buf` only once a whole frame is present.
pub fn decode_frame(buf: &mut BytesMut) -> CacheResult<Option<PeerMessage>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let type_len = read_u32(&buf[0..4]) as usize;
    if type_len == 0 || type_len > MAX_TYPE_LEN {
        return Err(CacheError::Serialization(format!(
            "invalid frame type length {type_len}"
        )));
    }
    if buf.len() < 4 + type_len + 4 {
        return Ok(None);
    }
    let payload_len = read_u32(&buf[4 + type_len..4 + type_len + 4]) as usize;
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(CacheError::Serialization(format!(
            "frame payload length {payload_len} exceeds limit"
        )));
    }
    let total = 8 + type_len + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let frame = buf.split_to(total);
    let kind = MessageType::from_bytes(&frame[4..4 + type_len])?;
    let payload = &frame[8 + type_len..];
    PeerMessage::decode(kind, payload).map(Some)
}

/// Encodes an acknowledgment token.
pub fn encode_ack(token: &str) -> Vec<u8> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(2 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Decodes a complete acknowledgment frame.
pub fn decode_ack(bytes: &[u8]) -> CacheResult<String> {
    if bytes.len() < 2 {
        return Err(CacheError::Serialization("truncated ack".to_string()));
    }
    let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    if bytes.len() < 2 + len {
        return Err(CacheError::Serialization("truncated ack body".to_string()));
    }
    String::from_utf8(bytes[2..2 + len].to_vec())
        .map_err(|_| CacheError::Serialization("ack is not UTF-8".to_string()))
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_invalidation() -> PeerMessage {
        PeerMessage::Invalidation(InvalidationMessage {
            cache_name: "users".to_string(),
            key: Some("u:1".to_string()),
            origin_node_id: "127.0.0.1:7400".to_string(),
            invalidate_all: false,
        })
    }

    fn sample_replication() -> PeerMessage {
        PeerMessage::Replication(ReplicationMessage {
            cache_name: "users".to_string(),
            key: "u:2".to_string(),
            value: serialize::encode(&"payload".to_string()).unwrap(),
            ttl_ms: 60_000,
            origin_node_id: "127.0.0.1:7400".to_string(),
        })
    }

    fn sample_heartbeat() -> PeerMessage {
        PeerMessage::Heartbeat(HeartbeatMessage::new("127.0.0.1:7400"))
    }

    #[test]
    fn message_types_round_trip() {
        for kind in [
            MessageType::Invalidation,
            MessageType::Replication,
            MessageType::Heartbeat,
        ] {
            assert_eq!(MessageType::from_bytes(kind.as_str().as_bytes()).unwrap(), kind);
        }
        assert!(MessageType::from_bytes(b"GOSSIP").is_err());
    }

    #[test]
    fn frames_round_trip_all_variants() {
        for message in [sample_invalidation(), sample_replication(), sample_heartbeat()] {
            let frame = encode_frame(&message).unwrap();
            let mut buf = BytesMut::from(&frame[..]);
            let decoded = decode_frame(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, message);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let frame = encode_frame(&sample_replication()).unwrap();
        for cut in [0usize, 3, 7, frame.len() - 1] {
            let mut buf = BytesMut::from(&frame[..cut]);
            assert!(decode_frame(&mut buf).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn two_frames_decode_in_order() {
        let first = sample_invalidation();
        let second = sample_heartbeat();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&first).unwrap());
        buf.extend_from_slice(&encode_frame(&second).unwrap());

        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), second);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_type_length_is_rejected() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0xFF, 0xFF, 0, 0, 0, 0][..]);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&6u32.to_be_bytes());
        frame.extend_from_slice(b"GOSSIP");
        frame.extend_from_slice(&0u32.to_be_bytes());
        let mut buf = BytesMut::from(&frame[..]);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn acks_round_trip() {
        assert_eq!(decode_ack(&encode_ack(ACK_OK)).unwrap(), "OK");
        assert_eq!(decode_ack(&encode_ack(ACK_ERROR)).unwrap(), "ERROR");
        assert!(decode_ack(&[0]).is_err());
    }

    #[test]
    fn replication_ttl_restores_duration() {
        if let PeerMessage::Replication(message) = sample_replication() {
            assert_eq!(message.ttl(), Duration::from_secs(60));
        } else {
            unreachable!();
        }
    }
}
