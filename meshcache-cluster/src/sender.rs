//! # Outbound Transport
//!
//! Purpose: Deliver framed messages to peers over pooled TCP sockets with
//! retry and a per-peer circuit breaker.
//!
//! ## Design Principles
//! 1. **One Socket Per Peer**: Each peer has a single pooled connection
//!    guarded by its own mutex; sends to different peers never contend.
//! 2. **Probe Before Reuse**: A non-blocking receive-side probe discards
//!    closed or desynchronized sockets instead of failing the send.
//! 3. **Retry Inside Breaker**: A logical send is up to three socket
//!    attempts but exactly one breaker outcome and one membership
//!    observation.
//! 4. **Fail Fast on Refusal**: An `ERROR` ack means the peer processed
//!    and rejected the frame; that is not retried.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use tracing::debug;

use meshcache_common::wire::{self, PeerMessage};
use meshcache_common::{CacheError, CacheResult};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::membership::Membership;

/// Longest acknowledgment body accepted from a peer.
const MAX_ACK_LEN: usize = 16;

/// Outbound transport tuning.
#[derive(Debug, Clone, Copy)]
pub struct SenderConfig {
    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,
    /// Read/write timeout applied to every socket.
    pub io_timeout: Duration,
    /// Attempts per logical send (I/O and timeout failures only).
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub retry_delay: Duration,
    /// Per-peer circuit breaker parameters.
    pub breaker: BreakerConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        SenderConfig {
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            breaker: BreakerConfig::default(),
        }
    }
}

struct PeerSlot {
    conn: Mutex<Option<TcpStream>>,
    breaker: Mutex<CircuitBreaker>,
}

/// Pooled, breaker-guarded sender for all peers.
pub struct PeerSender {
    config: SenderConfig,
    membership: Arc<Membership>,
    slots: RwLock<HashMap<String, Arc<PeerSlot>>>,
}

impl PeerSender {
    /// Creates a sender that mirrors send outcomes into `membership`.
    pub fn new(membership: Arc<Membership>, config: SenderConfig) -> Self {
        PeerSender {
            config,
            membership,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Sends one message with the full retry policy.
    pub fn send(&self, addr: &str, message: &PeerMessage) -> CacheResult<()> {
        self.send_with_attempts(addr, message, self.config.max_attempts)
    }

    /// Sends one message with a single attempt.
    ///
    /// Used for heartbeats: the probe is itself periodic, so retrying it
    /// would only delay the schedule.
    pub fn send_once(&self, addr: &str, message: &PeerMessage) -> CacheResult<()> {
        self.send_with_attempts(addr, message, 1)
    }

    /// Drops the pooled socket and breaker state for a removed peer.
    pub fn drop_peer(&self, addr: &str) {
        self.slots.write().remove(addr);
    }

    /// Closes every pooled socket.
    pub fn close_all(&self) {
        let slots = self.slots.read();
        for slot in slots.values() {
            *slot.conn.lock() = None;
        }
    }

    fn send_with_attempts(
        &self,
        addr: &str,
        message: &PeerMessage,
        attempts: u32,
    ) -> CacheResult<()> {
        let frame = wire::encode_frame(message)?;
        let slot = self.slot(addr);

        if !slot.breaker.lock().allow(Instant::now()) {
            self.membership.record_failure(addr);
            return Err(CacheError::ClusterCommunication(format!(
                "circuit open for peer {addr}"
            )));
        }

        let mut conn = slot.conn.lock();
        let result = self.exchange_with_retry(&mut conn, addr, &frame, attempts);
        let success = result.is_ok();
        if !success {
            *conn = None;
        }
        drop(conn);

        slot.breaker.lock().record(success, Instant::now());
        if success {
            self.membership.record_success(addr);
        } else {
            self.membership.record_failure(addr);
        }
        result
    }

    fn exchange_with_retry(
        &self,
        conn: &mut Option<TcpStream>,
        addr: &str,
        frame: &[u8],
        attempts: u32,
    ) -> CacheResult<()> {
        let mut last_error = String::new();
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                std::thread::sleep(self.config.retry_delay);
            }

            let stream = match self.ensure_connection(conn, addr) {
                Ok(stream) => stream,
                Err(err) => {
                    debug!(peer = %addr, attempt, error = %err, "connect failed");
                    last_error = err.to_string();
                    continue;
                }
            };

            match exchange(stream, frame) {
                Ok(ack) if ack == wire::ACK_OK => return Ok(()),
                Ok(ack) => {
                    // The peer processed the frame and refused it.
                    return Err(CacheError::ClusterCommunication(format!(
                        "peer {addr} replied {ack}"
                    )));
                }
                Err(err) => {
                    debug!(peer = %addr, attempt, error = %err, "send attempt failed");
                    last_error = err.to_string();
                    *conn = None;
                }
            }
        }

        Err(CacheError::ClusterCommunication(format!(
            "send to {addr} failed after {attempts} attempts: {last_error}"
        )))
    }

    fn ensure_connection<'a>(
        &self,
        conn: &'a mut Option<TcpStream>,
        addr: &str,
    ) -> std::io::Result<&'a mut TcpStream> {
        let reusable = conn.as_ref().map(socket_is_healthy).unwrap_or(false);
        if !reusable {
            *conn = Some(self.connect(addr)?);
        }
        match conn.as_mut() {
            Some(stream) => Ok(stream),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection unavailable",
            )),
        }
    }

    fn connect(&self, addr: &str) -> std::io::Result<TcpStream> {
        let socket_addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "address resolved to nothing")
            })?;
        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)?;
        stream.set_read_timeout(Some(self.config.io_timeout))?;
        stream.set_write_timeout(Some(self.config.io_timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn slot(&self, addr: &str) -> Arc<PeerSlot> {
        if let Some(slot) = self.slots.read().get(addr) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(addr.to_string()).or_insert_with(|| {
            Arc::new(PeerSlot {
                conn: Mutex::new(None),
                breaker: Mutex::new(CircuitBreaker::new(self.config.breaker)),
            })
        }))
    }
}

/// Writes one frame and reads the acknowledgment.
fn exchange(stream: &mut TcpStream, frame: &[u8]) -> std::io::Result<String> {
    stream.write_all(frame)?;

    let mut len_bytes = [0u8; 2];
    stream.read_exact(&mut len_bytes)?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    if len > MAX_ACK_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "oversized ack",
        ));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    String::from_utf8(body)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "ack is not UTF-8"))
}

/// Checks a pooled socket without blocking.
///
/// A socket is invalid if it is closed, has buffered bytes (the framing is
/// strictly request/ack, so leftovers mean desync), or errors on the probe.
fn socket_is_healthy(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let healthy = match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => false,
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    };
    healthy && stream.set_nonblocking(false).is_ok()
}
