//! Outbound connections: one resilient sender per remote node.
//!
//! A [`Sender`] owns a bounded queue and a writer task. `send` never blocks
//! and never fails loudly: messages that cannot be delivered are dropped and
//! counted. A write failure tears down the connection, discards whatever was
//! queued, and arms an exponential backoff before the next attempt — the
//! plane offers at-most-once delivery and retrying is the application's
//! business.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use switchyard_core::{NodeAddress, RoutedMessage, SharedWireCodec, StatsCollector};

use crate::frame::encode_frame;

/// Errors surfaced to a `send` caller. Both are routine and are expected to
/// be logged, not propagated.
#[derive(Debug, thiserror::Error)]
pub enum SenderError {
    /// The outbound queue is full; the message was dropped.
    #[error("outbound queue to {remote} is full")]
    QueueFull {
        /// Guid of the remote node.
        remote: String,
    },

    /// The sender has been stopped.
    #[error("sender is stopped")]
    Stopped,
}

/// Tunables for outbound connections.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Messages queued per remote before `send` starts dropping.
    pub queue_capacity: usize,
    /// Delay before the first reconnect attempt.
    pub initial_reconnect_delay: Duration,
    /// Ceiling for the reconnect backoff.
    pub max_reconnect_delay: Duration,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// When true, `stop` writes out whatever is still queued; when false
    /// queued messages are discarded.
    pub flush_on_stop: bool,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            initial_reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            flush_on_stop: false,
        }
    }
}

impl SenderConfig {
    /// Tuning for low-latency local networks: tighter timeouts, faster
    /// reconnects.
    pub fn local_network() -> Self {
        Self {
            queue_capacity: 1024,
            initial_reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_millis(500),
            flush_on_stop: false,
        }
    }
}

/// Reconnect backoff bookkeeping.
#[derive(Debug)]
struct ReconnectState {
    initial_delay: Duration,
    max_delay: Duration,
    current_delay: Duration,
    failure_count: u32,
}

impl ReconnectState {
    fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            current_delay: Duration::ZERO,
            failure_count: 0,
        }
    }

    /// Delay to observe before the next connect attempt.
    fn delay(&self) -> Duration {
        self.current_delay
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.current_delay = if self.current_delay.is_zero() {
            self.initial_delay
        } else {
            (self.current_delay * 2).min(self.max_delay)
        };
    }

    fn reset(&mut self) {
        self.current_delay = Duration::ZERO;
        self.failure_count = 0;
    }
}

/// One outbound connection worth of state: queue plus writer task.
pub struct Sender {
    remote: Arc<NodeAddress>,
    tx: mpsc::Sender<RoutedMessage>,
    shutdown_tx: mpsc::UnboundedSender<()>,
    stopped: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Sender {
    fn open(
        remote: Arc<NodeAddress>,
        codec: SharedWireCodec,
        config: SenderConfig,
        stats: Arc<dyn StatsCollector>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(writer_task(
            Arc::clone(&remote),
            rx,
            shutdown_rx,
            codec,
            config,
            stats,
        ));
        Arc::new(Self {
            remote,
            tx,
            shutdown_tx,
            stopped: AtomicBool::new(false),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// The node this sender delivers to.
    pub fn remote(&self) -> &Arc<NodeAddress> {
        &self.remote
    }

    /// Queue a message for delivery. Never blocks.
    ///
    /// # Errors
    ///
    /// [`SenderError::QueueFull`] when the queue is at capacity,
    /// [`SenderError::Stopped`] after `stop`. Either way the message is
    /// dropped; the caller decides whether that is worth a log line.
    pub fn send(&self, message: RoutedMessage) -> Result<(), SenderError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SenderError::Stopped);
        }
        self.tx.try_send(message).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SenderError::QueueFull {
                remote: self.remote.guid().to_string(),
            },
            mpsc::error::TrySendError::Closed(_) => SenderError::Stopped,
        })
    }

    /// Stop the writer. Queued messages are flushed or discarded per
    /// [`SenderConfig::flush_on_stop`]. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handle = self.writer.lock().expect("sender lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("remote", &self.remote.guid())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Encode `message` into its framed wire form. Returns false (after
/// counting a discard) when the message cannot be sent at all.
fn encode_wire(
    codec: &SharedWireCodec,
    remote: &NodeAddress,
    message: &RoutedMessage,
    wire: &mut BytesMut,
    stats: &Arc<dyn StatsCollector>,
) -> bool {
    wire.clear();
    let payload = match codec.encode_message(message) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(remote = %remote, %err, "failed to serialize outbound message");
            stats.message_discarded();
            return false;
        }
    };
    if payload.len() > remote.message_size_limit() {
        tracing::warn!(
            remote = %remote,
            size = payload.len(),
            limit = remote.message_size_limit(),
            "message exceeds peer's size limit"
        );
        stats.message_discarded();
        return false;
    }
    if let Err(err) = encode_frame(&payload, wire) {
        tracing::warn!(remote = %remote, %err, "failed to frame outbound message");
        stats.message_discarded();
        return false;
    }
    true
}

fn drain_discard(rx: &mut mpsc::Receiver<RoutedMessage>, stats: &Arc<dyn StatsCollector>) {
    let mut dropped = 0u64;
    while rx.try_recv().is_ok() {
        dropped += 1;
        stats.message_discarded();
    }
    if dropped > 0 {
        tracing::debug!(dropped, "discarded queued outbound messages");
    }
}

async fn writer_task(
    remote: Arc<NodeAddress>,
    mut rx: mpsc::Receiver<RoutedMessage>,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
    codec: SharedWireCodec,
    config: SenderConfig,
    stats: Arc<dyn StatsCollector>,
) {
    let mut connection: Option<TcpStream> = None;
    let mut reconnect =
        ReconnectState::new(config.initial_reconnect_delay, config.max_reconnect_delay);
    let mut wire = BytesMut::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                if config.flush_on_stop {
                    while let Ok(message) = rx.try_recv() {
                        if !encode_wire(&codec, &remote, &message, &mut wire, &stats) {
                            continue;
                        }
                        let Some(stream) = connection.as_mut() else {
                            stats.message_discarded();
                            continue;
                        };
                        if stream.write_all(&wire).await.is_err() {
                            stats.message_discarded();
                            drain_discard(&mut rx, &stats);
                            break;
                        }
                    }
                } else {
                    drain_discard(&mut rx, &stats);
                }
                break;
            }
            message = rx.recv() => {
                let Some(message) = message else { break };

                if !encode_wire(&codec, &remote, &message, &mut wire, &stats) {
                    continue;
                }

                if connection.is_none() {
                    let delay = reconnect.delay();
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = shutdown_rx.recv() => {
                                stats.message_discarded();
                                drain_discard(&mut rx, &stats);
                                return;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    let attempt = tokio::time::timeout(
                        config.connect_timeout,
                        TcpStream::connect(remote.socket_addr()),
                    )
                    .await;
                    match attempt {
                        Ok(Ok(stream)) => {
                            tracing::debug!(remote = %remote, "connected");
                            connection = Some(stream);
                            reconnect.reset();
                        }
                        _ => {
                            reconnect.record_failure();
                            tracing::warn!(
                                remote = %remote,
                                failures = reconnect.failure_count,
                                "connect failed, dropping queued messages"
                            );
                            stats.message_discarded();
                            drain_discard(&mut rx, &stats);
                            continue;
                        }
                    }
                }

                if let Some(stream) = connection.as_mut() {
                    if let Err(err) = stream.write_all(&wire).await {
                        tracing::warn!(remote = %remote, %err, "write failed, dropping queued messages");
                        connection = None;
                        reconnect.record_failure();
                        stats.message_discarded();
                        drain_discard(&mut rx, &stats);
                    }
                }
            }
        }
    }
}

/// All live senders, one per remote node address.
pub struct SenderPool {
    codec: SharedWireCodec,
    config: SenderConfig,
    stats: Arc<dyn StatsCollector>,
    senders: Mutex<HashMap<String, Arc<Sender>>>,
    is_shutdown: AtomicBool,
}

impl SenderPool {
    /// Create an empty pool.
    pub fn new(
        codec: SharedWireCodec,
        config: SenderConfig,
        stats: Arc<dyn StatsCollector>,
    ) -> Self {
        Self {
            codec,
            config,
            stats,
            senders: Mutex::new(HashMap::new()),
            is_shutdown: AtomicBool::new(false),
        }
    }

    /// Get the live sender for `remote`, opening one if needed.
    ///
    /// # Errors
    ///
    /// [`SenderError::Stopped`] after `shutdown`.
    pub fn open(&self, remote: Arc<NodeAddress>) -> Result<Arc<Sender>, SenderError> {
        if self.is_shutdown.load(Ordering::Acquire) {
            return Err(SenderError::Stopped);
        }
        let mut senders = self.senders.lock().expect("sender pool lock poisoned");
        let sender = senders
            .entry(remote.guid().to_string())
            .or_insert_with(|| {
                Sender::open(
                    remote,
                    Arc::clone(&self.codec),
                    self.config.clone(),
                    Arc::clone(&self.stats),
                )
            });
        Ok(Arc::clone(sender))
    }

    /// Stop and forget the sender for `remote`, if any.
    pub async fn stop(&self, remote: &NodeAddress) {
        let sender = self
            .senders
            .lock()
            .expect("sender pool lock poisoned")
            .remove(remote.guid());
        if let Some(sender) = sender {
            sender.stop().await;
        }
    }

    /// Stop every sender. Idempotent.
    pub async fn shutdown(&self) {
        if self.is_shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<Sender>> = {
            let mut senders = self.senders.lock().expect("sender pool lock poisoned");
            senders.drain().map(|(_, s)| s).collect()
        };
        for sender in drained {
            sender.stop().await;
        }
    }
}
