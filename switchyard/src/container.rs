//! Contracts between the threading model and the containers it feeds.
//!
//! A *container* is the per-node, per-cluster runtime that owns the per-key
//! processor instances. The message plane never looks inside one; it only
//! needs somewhere to put work, in the right order, exactly once.

use std::sync::Arc;

use switchyard_core::{ClusterId, RoutedMessage};

/// The per-cluster runtime a node hosts. External to the message plane.
pub trait MessageContainer: Send + Sync {
    /// The cluster this container runs.
    fn cluster_id(&self) -> &ClusterId;

    /// Process one message. Called from the container's dedicated worker,
    /// strictly in arrival order for this container.
    fn deliver(&self, message: Arc<RoutedMessage>);

    /// A message addressed at this container was dropped before delivery
    /// (shutdown or overflow).
    fn rejected(&self, message: Arc<RoutedMessage>);
}

/// Where one individuated piece of a message is headed.
#[derive(Clone)]
pub struct ContainerJobMetadata {
    /// The destination container.
    pub container: Arc<dyn MessageContainer>,
}

impl ContainerJobMetadata {
    /// Stable key identifying the destination container instance.
    pub(crate) fn container_key(&self) -> usize {
        Arc::as_ptr(&self.container) as *const () as usize
    }
}

impl std::fmt::Debug for ContainerJobMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerJobMetadata")
            .field("cluster", self.container.cluster_id())
            .finish()
    }
}

/// An inbound message on its way through the threading model.
///
/// The job starts opaque: `calculate_containers` (run on the
/// deserialization pool) decodes it and works out the destination
/// containers on this node. Once calculated, the job is *individuated*
/// into one [`ContainerJob`] per destination. When every individuated job
/// has executed or been rejected, `individuated_jobs_complete` releases
/// whatever the job still holds (typically the receive buffer).
pub trait MessageDeliveryJob: Send + Sync {
    /// True once the destination containers are known.
    fn containers_calculated(&self) -> bool;

    /// Deserialize and resolve destinations. Runs off the shuttle, possibly
    /// in parallel with other jobs.
    fn calculate_containers(&self);

    /// The resolved destinations. Empty means the message cannot be
    /// delivered (bad payload, unknown containers) and will be rejected.
    fn container_data(&self) -> Vec<ContainerJobMetadata>;

    /// Split into one [`ContainerJob`] per entry of `container_data`, in
    /// the same order.
    fn individuate(&self) -> Vec<Box<dyn ContainerJob>>;

    /// The whole job was dropped before individuation.
    fn rejected(&self);

    /// Every individuated job has finished; release resources.
    fn individuated_jobs_complete(&self);
}

/// The unit of work owed to a single container. Exactly one of `execute`
/// or `reject` is called, exactly once.
pub trait ContainerJob: Send {
    /// Deliver to the destination container.
    fn execute(self: Box<Self>, meta: &ContainerJobMetadata);

    /// Drop without delivering, telling the container.
    fn reject(self: Box<Self>, meta: &ContainerJobMetadata);
}
