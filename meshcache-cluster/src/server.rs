//! # Inbound Transport
//!
//! Accept mesh connections, read exactly one framed message per
//! connection, dispatch it to the coordinator, and reply `OK` or `ERROR`.
//!
//! ## Design Principles
//! 1. **One Frame Per Connection**: The accept loop stays trivial and a
//!    misbehaving peer can hold at most one handler task.
//! 2. **Bounded Reads**: Every connection read runs under the configured
//!    timeout; decode failures answer `ERROR` and log at WARN.
//! 3. **Graceful Shutdown**: The listener closes first, then outstanding
//!    handlers get a grace window before being aborted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use meshcache_common::wire::{self, PeerMessage};
use meshcache_common::{CacheError, CacheResult};

use crate::coordinator::Coordinator;

/// Inbound listener tuning.
#[derive(Debug, Clone, Copy)]
pub struct ListenerConfig {
    /// Timeout for reading one complete frame.
    pub read_timeout: Duration,
    /// Grace period for in-flight handlers during shutdown.
    pub shutdown_grace: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            read_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Running mesh listener.
pub struct MeshListener {
    local_addr: SocketAddr,
    config: ListenerConfig,
    shutdown_tx: watch::Sender<bool>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl MeshListener {
    /// Starts serving on a pre-bound listener.
    ///
    /// Binding happens outside the runtime so the caller can learn the
    /// actual port (ephemeral binds) before the node id is fixed.
    pub fn start(
        handle: &Handle,
        listener: std::net::TcpListener,
        coordinator: Arc<Coordinator>,
        config: ListenerConfig,
    ) -> CacheResult<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = handle.spawn(accept_loop(listener, coordinator, config, shutdown_rx));
        info!(addr = %local_addr, "mesh listener started");

        Ok(MeshListener {
            local_addr,
            config,
            shutdown_tx,
            accept_task,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for handlers within the grace period.
    pub fn stop(self, handle: &Handle) {
        let _ = self.shutdown_tx.send(true);
        let wait = self.config.shutdown_grace + Duration::from_secs(1);
        let _ = handle.block_on(async {
            let _ = tokio::time::timeout(wait, self.accept_task).await;
        });
        info!(addr = %self.local_addr, "mesh listener stopped");
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    coordinator: Arc<Coordinator>,
    config: ListenerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(error = %err, "listener registration failed");
            return;
        }
    };

    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                let _ = changed;
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let coordinator = Arc::clone(&coordinator);
                    handlers.spawn(handle_connection(
                        stream,
                        peer,
                        coordinator,
                        config.read_timeout,
                    ));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            // Reap finished handlers so the set stays small.
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
        }
    }

    drop(listener);
    let drain = async {
        while handlers.join_next().await.is_some() {}
    };
    if tokio::time::timeout(config.shutdown_grace, drain).await.is_err() {
        warn!("forcing termination of in-flight connection handlers");
        handlers.shutdown().await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    coordinator: Arc<Coordinator>,
    read_timeout: Duration,
) {
    let ack = match tokio::time::timeout(read_timeout, read_frame(&mut stream)).await {
        Ok(Ok(message)) => match coordinator.apply(message) {
            Ok(()) => wire::ACK_OK,
            Err(err) => {
                warn!(peer = %peer, error = %err, "inbound message failed to apply");
                wire::ACK_ERROR
            }
        },
        Ok(Err(err)) => {
            warn!(peer = %peer, error = %err, "inbound frame rejected");
            wire::ACK_ERROR
        }
        Err(_) => {
            warn!(peer = %peer, "inbound read timed out");
            wire::ACK_ERROR
        }
    };

    if let Err(err) = stream.write_all(&wire::encode_ack(ack)).await {
        debug!(peer = %peer, error = %err, "ack write failed");
    }
    let _ = stream.shutdown().await;
}

/// Reads exactly one framed message.
async fn read_frame(stream: &mut TcpStream) -> CacheResult<PeerMessage> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(message) = wire::decode_frame(&mut buf)? {
            return Ok(message);
        }
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Err(CacheError::Serialization(
                "connection closed mid-frame".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::DispatchMode;
    use crate::membership::{Membership, MembershipConfig};
    use crate::sender::{PeerSender, SenderConfig};
    use meshcache_common::wire::InvalidationMessage;
    use meshcache_store::CacheStore;
    use std::io::{Read, Write};

    fn test_stack() -> (Arc<Coordinator>, Arc<CacheStore>) {
        let store = Arc::new(CacheStore::new());
        let membership = Arc::new(Membership::new("127.0.0.1:0", MembershipConfig::default()));
        let sender = Arc::new(PeerSender::new(
            Arc::clone(&membership),
            SenderConfig::default(),
        ));
        let coordinator = Arc::new(
            Coordinator::new(
                "127.0.0.1:0",
                Arc::clone(&store),
                membership,
                sender,
                DispatchMode::Async,
            )
            .unwrap(),
        );
        (coordinator, store)
    }

    fn start_listener(
        runtime: &tokio::runtime::Runtime,
        coordinator: Arc<Coordinator>,
    ) -> MeshListener {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        MeshListener::start(
            runtime.handle(),
            std_listener,
            coordinator,
            ListenerConfig {
                read_timeout: Duration::from_millis(500),
                shutdown_grace: Duration::from_millis(500),
            },
        )
        .unwrap()
    }

    fn read_ack(stream: &mut std::net::TcpStream) -> String {
        let mut len_bytes = [0u8; 2];
        stream.read_exact(&mut len_bytes).unwrap();
        let len = u16::from_be_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).unwrap();
        String::from_utf8(body).unwrap()
    }

    #[test]
    fn valid_frame_is_applied_and_acked() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (coordinator, store) = test_stack();
        store.put("c", "k", Arc::from(&b"v"[..]), None, "origin");
        let listener = start_listener(&runtime, coordinator);

        let frame = wire::encode_frame(&PeerMessage::Invalidation(InvalidationMessage {
            cache_name: "c".to_string(),
            key: Some("k".to_string()),
            origin_node_id: "peer".to_string(),
            invalidate_all: false,
        }))
        .unwrap();

        let mut stream = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        stream.write_all(&frame).unwrap();
        assert_eq!(read_ack(&mut stream), "OK");
        assert!(store.get("c", "k").is_none());

        listener.stop(runtime.handle());
    }

    #[test]
    fn garbage_frame_gets_error_ack() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (coordinator, _store) = test_stack();
        let listener = start_listener(&runtime, coordinator);

        let mut stream = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        stream.write_all(&[0xFF; 16]).unwrap();
        assert_eq!(read_ack(&mut stream), "ERROR");

        listener.stop(runtime.handle());
    }

    #[test]
    fn truncated_frame_times_out_with_error_ack() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (coordinator, _store) = test_stack();
        let listener = start_listener(&runtime, coordinator);

        let frame = wire::encode_frame(&PeerMessage::Invalidation(InvalidationMessage {
            cache_name: "c".to_string(),
            key: None,
            origin_node_id: "peer".to_string(),
            invalidate_all: true,
        }))
        .unwrap();

        let mut stream = std::net::TcpStream::connect(listener.local_addr()).unwrap();
        stream.write_all(&frame[..frame.len() - 2]).unwrap();
        assert_eq!(read_ack(&mut stream), "ERROR");

        listener.stop(runtime.handle());
    }

    #[test]
    fn stop_terminates_the_accept_loop() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (coordinator, _store) = test_stack();
        let listener = start_listener(&runtime, coordinator);
        let addr = listener.local_addr();
        listener.stop(runtime.handle());

        assert!(std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_err());
    }
}
