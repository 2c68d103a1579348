//! Frame-oriented TCP receiver.
//!
//! One **acceptor** task owns the listening socket and deals accepted
//! connections round-robin to a fixed set of **reader** tasks. Each reader
//! owns its connections: per connection a loop frames the stream per
//! [`crate::frame`] and hands every complete frame to the [`Listener`].
//!
//! A corrupt frame drops only the offending connection; a peer hanging up
//! is routine. Commands (new connection, disrupt, shutdown) travel over a
//! per-reader channel, so a reader is never touched from outside its task.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use switchyard_core::{config, NodeAddress, NodeConfiguration};

use crate::frame::{read_frame, FrameError, LazyFrame};
use crate::pool::BufferPool;

/// Bound on how long `close()` waits for any one task to acknowledge.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Receives complete inbound frames.
///
/// Implementations must not block the calling reader for long; hand the
/// frame off and return. The frame's buffer is released when the
/// [`LazyFrame`] is dropped.
pub trait Listener: Send + Sync {
    /// One complete frame arrived.
    fn on_message(&self, frame: LazyFrame);
}

/// Errors from receiver startup.
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    /// The listening socket could not be bound.
    #[error("failed to bind receiver: {0}")]
    Bind(#[source] std::io::Error),

    /// The configured bind specification resolved to nothing usable.
    #[error("cannot resolve bind address from {spec:?}")]
    BindAddress {
        /// The offending configuration value.
        spec: String,
    },

    /// `start` was called twice, or after `close`.
    #[error("receiver already started or stopped")]
    AlreadyStarted,
}

/// Tunables for a [`FramedReceiver`].
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Bind address specification: an IP literal or a resolvable host name.
    /// Unset binds loopback.
    pub bind_spec: Option<String>,
    /// Number of reader tasks.
    pub num_handlers: usize,
    /// Largest acceptable frame body, in bytes.
    pub max_message_size: usize,
    /// Receive-buffer size advertised to peers, in bytes.
    pub recv_buffer_size: usize,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind_spec: None,
            num_handlers: config::DEFAULT_NUM_HANDLERS,
            max_message_size: config::DEFAULT_MAX_MESSAGE_SIZE,
            recv_buffer_size: 64 * 1024,
        }
    }
}

impl ReceiverConfig {
    /// Read the recognized receiver keys out of a node configuration.
    pub fn from_node_config(node_config: &NodeConfiguration) -> Self {
        let defaults = Self::default();
        Self {
            bind_spec: node_config
                .get(config::RECEIVER_NETWORK_IF)
                .map(String::from),
            num_handlers: node_config
                .get_usize(config::RECEIVER_NUM_HANDLERS, defaults.num_handlers),
            max_message_size: node_config
                .get_usize(config::RECEIVER_MAX_MESSAGE_SIZE, defaults.max_message_size),
            ..defaults
        }
    }
}

enum ReaderCommand {
    NewConnection(TcpStream, SocketAddr),
    Disrupt {
        ip: IpAddr,
        found: oneshot::Sender<bool>,
    },
}

struct ReaderShared {
    pool: Arc<BufferPool>,
    listener: Arc<dyn Listener>,
    max_message_size: usize,
}

struct ReaderHandle {
    cmd_tx: mpsc::UnboundedSender<ReaderCommand>,
    handle: JoinHandle<()>,
}

struct AcceptorHandle {
    shutdown_tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
}

/// Selector-style frame receiver: accept, frame, deliver.
pub struct FramedReceiver {
    config: ReceiverConfig,
    address: Arc<NodeAddress>,
    running: Arc<AtomicBool>,
    pool: Arc<BufferPool>,
    socket: Option<TcpListener>,
    readers: Vec<ReaderHandle>,
    acceptor: Option<AcceptorHandle>,
}

impl FramedReceiver {
    /// Bind the listening socket and fix this node's advertised address.
    ///
    /// # Errors
    ///
    /// [`ReceiverError::Bind`] when the socket cannot be bound,
    /// [`ReceiverError::BindAddress`] when `bind_spec` resolves to nothing.
    pub async fn bind(config: ReceiverConfig, codec_id: &str) -> Result<Self, ReceiverError> {
        let ip = resolve_bind_ip(config.bind_spec.as_deref())?;
        let socket = TcpListener::bind((ip, config.port))
            .await
            .map_err(ReceiverError::Bind)?;
        let local = socket.local_addr().map_err(ReceiverError::Bind)?;

        let address = Arc::new(NodeAddress::new(
            local.ip(),
            local.port(),
            codec_id,
            config.recv_buffer_size,
            config.max_message_size,
        ));
        tracing::debug!(%address, "receiver bound");

        Ok(Self {
            config,
            address,
            running: Arc::new(AtomicBool::new(true)),
            pool: Arc::new(BufferPool::new()),
            socket: Some(socket),
            readers: Vec::new(),
            acceptor: None,
        })
    }

    /// This node's advertised address.
    pub fn address(&self) -> Arc<NodeAddress> {
        Arc::clone(&self.address)
    }

    /// The receive-buffer pool, exposed so callers can observe buffer
    /// accounting.
    pub fn buffer_pool(&self) -> Arc<BufferPool> {
        Arc::clone(&self.pool)
    }

    /// Spawn the acceptor and reader tasks and begin delivering frames to
    /// `listener`.
    ///
    /// # Errors
    ///
    /// [`ReceiverError::AlreadyStarted`] if called twice or after `close`.
    pub fn start(&mut self, listener: Arc<dyn Listener>) -> Result<(), ReceiverError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(ReceiverError::AlreadyStarted);
        }
        let socket = self.socket.take().ok_or(ReceiverError::AlreadyStarted)?;

        let shared = Arc::new(ReaderShared {
            pool: Arc::clone(&self.pool),
            listener,
            max_message_size: self.config.max_message_size,
        });

        let mut cmd_txs = Vec::with_capacity(self.config.num_handlers);
        for index in 0..self.config.num_handlers.max(1) {
            let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
            let handle = tokio::spawn(reader_task(Arc::clone(&shared), cmd_rx, index));
            cmd_txs.push(cmd_tx.clone());
            self.readers.push(ReaderHandle { cmd_tx, handle });
        }

        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(acceptor_task(
            socket,
            Arc::clone(&self.running),
            cmd_txs,
            shutdown_rx,
        ));
        self.acceptor = Some(AcceptorHandle { shutdown_tx, handle });
        Ok(())
    }

    /// Force-close every connection from the given peer. Returns true when
    /// at least one connection was found.
    pub async fn disrupt(&self, addr: &NodeAddress) -> bool {
        let mut any = false;
        for reader in &self.readers {
            let (found_tx, found_rx) = oneshot::channel();
            if reader
                .cmd_tx
                .send(ReaderCommand::Disrupt {
                    ip: addr.ip(),
                    found: found_tx,
                })
                .is_err()
            {
                continue;
            }
            if let Ok(found) = found_rx.await {
                any |= found;
            }
        }
        any
    }

    /// Stop accepting, close every connection, and wait for all tasks to
    /// acknowledge.
    pub async fn close(&mut self) {
        self.running.store(false, Ordering::Release);

        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.shutdown_tx.send(());
            if tokio::time::timeout(SHUTDOWN_WAIT, acceptor.handle)
                .await
                .is_err()
            {
                tracing::warn!("acceptor did not stop in time");
            }
        }

        for reader in self.readers.drain(..) {
            drop(reader.cmd_tx);
            if tokio::time::timeout(SHUTDOWN_WAIT, reader.handle)
                .await
                .is_err()
            {
                tracing::warn!("reader did not stop in time");
            }
        }
    }
}

fn resolve_bind_ip(spec: Option<&str>) -> Result<IpAddr, ReceiverError> {
    let Some(spec) = spec else {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    };

    if let Ok(ip) = spec.parse::<IpAddr>() {
        return Ok(ip);
    }

    // Treat the value as a host name; take the first non-loopback IPv4.
    (spec, 0u16)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| {
            addrs.find(|a| matches!(a.ip(), IpAddr::V4(v4) if !v4.is_loopback()))
        })
        .map(|a| a.ip())
        .ok_or_else(|| ReceiverError::BindAddress {
            spec: spec.to_string(),
        })
}

async fn acceptor_task(
    socket: TcpListener,
    running: Arc<AtomicBool>,
    cmd_txs: Vec<mpsc::UnboundedSender<ReaderCommand>>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    let mut accept_seq: u64 = 0;
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, remote)) => {
                    if !running.load(Ordering::Acquire) {
                        break;
                    }
                    let index = (accept_seq % cmd_txs.len() as u64) as usize;
                    accept_seq += 1;
                    tracing::trace!(%remote, reader = index, "accepted connection");
                    if cmd_txs[index]
                        .send(ReaderCommand::NewConnection(stream, remote))
                        .is_err()
                    {
                        break; // reader gone: shutting down
                    }
                }
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                }
            },
        }
    }
}

struct ConnectionHandle {
    remote: SocketAddr,
    close_tx: mpsc::UnboundedSender<()>,
    handle: JoinHandle<()>,
}

async fn reader_task(
    shared: Arc<ReaderShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<ReaderCommand>,
    reader_index: usize,
) {
    let mut next_id: u64 = 0;
    let mut connections: HashMap<u64, ConnectionHandle> = HashMap::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None => break,
                Some(ReaderCommand::NewConnection(stream, remote)) => {
                    tracing::debug!(reader = reader_index, %remote, "reader took connection");
                    let id = next_id;
                    next_id += 1;
                    let (close_tx, close_rx) = mpsc::unbounded_channel();
                    let handle = tokio::spawn(connection_loop(
                        stream,
                        remote,
                        Arc::clone(&shared),
                        close_rx,
                        done_tx.clone(),
                        id,
                    ));
                    connections.insert(id, ConnectionHandle { remote, close_tx, handle });
                }
                Some(ReaderCommand::Disrupt { ip, found }) => {
                    let mut any = false;
                    for conn in connections.values() {
                        if conn.remote.ip() == ip {
                            let _ = conn.close_tx.send(());
                            any = true;
                        }
                    }
                    let _ = found.send(any);
                }
            },
            Some(id) = done_rx.recv() => {
                connections.remove(&id);
            }
        }
    }

    // command channel closed: tear down remaining connections
    for conn in connections.values() {
        let _ = conn.close_tx.send(());
    }
    for (_, conn) in connections {
        let _ = conn.handle.await;
    }
}

async fn connection_loop(
    mut stream: TcpStream,
    remote: SocketAddr,
    shared: Arc<ReaderShared>,
    mut close_rx: mpsc::UnboundedReceiver<()>,
    done_tx: mpsc::UnboundedSender<u64>,
    id: u64,
) {
    loop {
        tokio::select! {
            _ = close_rx.recv() => {
                tracing::debug!(%remote, "connection closed by command");
                break;
            }
            result = read_frame(&mut stream, &shared.pool, shared.max_message_size) => match result {
                Ok(Some(frame)) => shared.listener.on_message(frame),
                Ok(None) => {
                    tracing::debug!(%remote, "connection closed by peer");
                    break;
                }
                Err(FrameError::Corrupt { size, limit }) => {
                    tracing::warn!(%remote, size, limit, "corrupt frame, dropping connection");
                    break;
                }
                Err(err) => {
                    tracing::debug!(%remote, %err, "connection failed");
                    break;
                }
            },
        }
    }
    let _ = done_tx.send(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bind_ip_default_is_loopback() {
        let ip = resolve_bind_ip(None).expect("default should resolve");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn test_resolve_bind_ip_literal() {
        let ip = resolve_bind_ip(Some("10.1.2.3")).expect("literal should resolve");
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn test_resolve_bind_ip_garbage_fails() {
        let err = resolve_bind_ip(Some("no.such.host.invalid")).expect_err("should fail");
        assert!(matches!(err, ReceiverError::BindAddress { .. }));
    }

    #[test]
    fn test_config_from_node_config() {
        let node_config = NodeConfiguration::new()
            .set(config::RECEIVER_NUM_HANDLERS, "3")
            .set(config::RECEIVER_MAX_MESSAGE_SIZE, "1024");
        let receiver_config = ReceiverConfig::from_node_config(&node_config);
        assert_eq!(receiver_config.num_handlers, 3);
        assert_eq!(receiver_config.max_message_size, 1024);
        assert_eq!(receiver_config.bind_spec, None);
    }
}
