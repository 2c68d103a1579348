//! Node-side glue: inbound frames become container work.
//!
//! [`NodeReceiver`] is the transport listener for a node. Every inbound
//! frame is wrapped as a [`MessageDeliveryJob`] that deserializes lazily on
//! the threading model's pool; the local loopback path skips the wire (and
//! the codec) entirely. [`NodeRegistration`] publishes the node's
//! directory entry so the rest of the fleet can route to it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use switchyard_core::{
    CoordinationError, CoordinationSession, DirMode, NodeInformation, RootPaths, RoutedMessage,
    SharedWireCodec, StatsCollector,
};
use switchyard_transport::{LazyFrame, Listener};

use crate::container::{
    ContainerJob, ContainerJobMetadata, MessageContainer, MessageDeliveryJob,
};
use crate::threading::OrderedPerContainerThreadingModel;

/// Entry point for everything addressed at this node.
pub struct NodeReceiver {
    threading: Arc<OrderedPerContainerThreadingModel>,
    hosted: Arc<Vec<Arc<dyn MessageContainer>>>,
    codec: SharedWireCodec,
    stats: Arc<dyn StatsCollector>,
}

impl NodeReceiver {
    /// Wire the node's containers (by index) to the threading model.
    pub fn new(
        threading: Arc<OrderedPerContainerThreadingModel>,
        containers: Vec<Arc<dyn MessageContainer>>,
        codec: SharedWireCodec,
        stats: Arc<dyn StatsCollector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            threading,
            hosted: Arc::new(containers),
            codec,
            stats,
        })
    }

    /// Deliver a locally routed message without touching the wire. The
    /// destination containers are already known, so the job skips the
    /// deserialization stage.
    pub fn feedback_loop(&self, message: RoutedMessage) {
        let deliveries = resolve_containers(&self.hosted, &message.containers);
        self.threading.submit(Arc::new(LoopbackJob {
            message: Arc::new(message),
            deliveries,
            stats: Arc::clone(&self.stats),
        }));
    }
}

impl Listener for NodeReceiver {
    fn on_message(&self, frame: LazyFrame) {
        self.stats.message_received();
        // the network is the fan-in point: inbound work is counted against
        // the limited ceiling, local feedback is not
        self.threading.submit_limited(Arc::new(InboundMessageJob {
            hosted: Arc::clone(&self.hosted),
            codec: Arc::clone(&self.codec),
            stats: Arc::clone(&self.stats),
            state: Mutex::new(InboundState {
                frame: Some(frame),
                message: None,
                deliveries: Vec::new(),
            }),
            calculated: AtomicBool::new(false),
        }));
    }
}

fn resolve_containers(
    hosted: &Arc<Vec<Arc<dyn MessageContainer>>>,
    indexes: &[u32],
) -> Vec<ContainerJobMetadata> {
    let mut deliveries = Vec::with_capacity(indexes.len());
    for index in indexes {
        match hosted.get(*index as usize) {
            Some(container) => deliveries.push(ContainerJobMetadata {
                container: Arc::clone(container),
            }),
            None => {
                tracing::warn!(index, "message addressed an unknown container index");
            }
        }
    }
    deliveries
}

struct InboundState {
    frame: Option<LazyFrame>,
    message: Option<Arc<RoutedMessage>>,
    deliveries: Vec<ContainerJobMetadata>,
}

/// An inbound frame travelling the threading model. Holds its receive
/// buffer until every individuated piece has finished.
struct InboundMessageJob {
    hosted: Arc<Vec<Arc<dyn MessageContainer>>>,
    codec: SharedWireCodec,
    stats: Arc<dyn StatsCollector>,
    state: Mutex<InboundState>,
    calculated: AtomicBool,
}

impl MessageDeliveryJob for InboundMessageJob {
    fn containers_calculated(&self) -> bool {
        self.calculated.load(Ordering::Acquire)
    }

    fn calculate_containers(&self) {
        {
            let mut state = self.state.lock().expect("inbound job lock poisoned");
            if let Some(frame) = state.frame.as_ref() {
                match self.codec.decode_message(frame.payload()) {
                    Ok(message) => {
                        state.deliveries = resolve_containers(&self.hosted, &message.containers);
                        state.message = Some(Arc::new(message));
                    }
                    Err(err) => {
                        // leaves deliveries empty; the shuttle rejects the job
                        tracing::warn!(%err, "failed to deserialize inbound message");
                    }
                }
            }
        }
        self.calculated.store(true, Ordering::Release);
    }

    fn container_data(&self) -> Vec<ContainerJobMetadata> {
        self.state
            .lock()
            .expect("inbound job lock poisoned")
            .deliveries
            .clone()
    }

    fn individuate(&self) -> Vec<Box<dyn ContainerJob>> {
        let state = self.state.lock().expect("inbound job lock poisoned");
        let Some(message) = state.message.as_ref() else {
            return Vec::new();
        };
        state
            .deliveries
            .iter()
            .map(|_| {
                Box::new(DeliveryContainerJob {
                    message: Arc::clone(message),
                }) as Box<dyn ContainerJob>
            })
            .collect()
    }

    fn rejected(&self) {
        self.stats.message_discarded();
        let mut state = self.state.lock().expect("inbound job lock poisoned");
        state.frame.take();
        state.message.take();
    }

    fn individuated_jobs_complete(&self) {
        // returning the frame's buffer to the pool is the release
        self.state
            .lock()
            .expect("inbound job lock poisoned")
            .frame
            .take();
    }
}

/// A locally dispatched message: containers known from birth.
struct LoopbackJob {
    message: Arc<RoutedMessage>,
    deliveries: Vec<ContainerJobMetadata>,
    stats: Arc<dyn StatsCollector>,
}

impl MessageDeliveryJob for LoopbackJob {
    fn containers_calculated(&self) -> bool {
        true
    }

    fn calculate_containers(&self) {}

    fn container_data(&self) -> Vec<ContainerJobMetadata> {
        self.deliveries.clone()
    }

    fn individuate(&self) -> Vec<Box<dyn ContainerJob>> {
        self.deliveries
            .iter()
            .map(|_| {
                Box::new(DeliveryContainerJob {
                    message: Arc::clone(&self.message),
                }) as Box<dyn ContainerJob>
            })
            .collect()
    }

    fn rejected(&self) {
        self.stats.message_discarded();
    }

    fn individuated_jobs_complete(&self) {}
}

struct DeliveryContainerJob {
    message: Arc<RoutedMessage>,
}

impl ContainerJob for DeliveryContainerJob {
    fn execute(self: Box<Self>, meta: &ContainerJobMetadata) {
        meta.container.deliver(self.message);
    }

    fn reject(self: Box<Self>, meta: &ContainerJobMetadata) {
        meta.container.rejected(self.message);
    }
}

/// Publishes this node's entry in the coordination directory.
pub struct NodeRegistration {
    session: Arc<dyn CoordinationSession>,
    paths: RootPaths,
}

impl NodeRegistration {
    /// Registration against one application root.
    pub fn new(session: Arc<dyn CoordinationSession>, paths: RootPaths) -> Self {
        Self { session, paths }
    }

    /// Write the node's information blob at `<root>/nodes/<guid>`.
    ///
    /// # Errors
    ///
    /// Propagates [`CoordinationError`]; callers retry on their own cadence.
    pub async fn register(&self, info: &NodeInformation) -> Result<(), CoordinationError> {
        let blob =
            serde_json::to_vec(info).map_err(|e| CoordinationError::Backend(e.to_string()))?;
        self.session
            .mkdir_recursive(&self.paths.nodes_dir(), DirMode::Persistent)
            .await?;
        let node_path = self.paths.node_dir(info.node_address.guid());
        self.session
            .mkdir_recursive(&node_path, DirMode::Ephemeral)
            .await?;
        self.session.set_data(&node_path, &blob).await?;
        tracing::debug!(node = %info.node_address, "registered in directory");
        Ok(())
    }

    /// Remove the node's directory entry.
    ///
    /// # Errors
    ///
    /// Propagates [`CoordinationError`].
    pub async fn unregister(&self, guid: &str) -> Result<(), CoordinationError> {
        self.session.rmdir(&self.paths.node_dir(guid)).await
    }
}
