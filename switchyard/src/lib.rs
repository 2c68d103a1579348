//! Switchyard: a distributed elastic message plane.
//!
//! A fleet of nodes cooperatively routes keyed messages to stateful
//! per-key handlers living in logical *clusters*. Each node hosts a subset
//! of clusters and, within a cluster, owns a subset of keys; for every key,
//! messages are processed in arrival order by exactly one handler instance
//! per cluster at a time.
//!
//! # Architecture
//!
//! ```text
//! app ──▶ OutgoingDispatcher ──▶ RoutingSnapshot ──▶ SenderPool ──▶ network
//!                                     ▲
//!                        RoutingTableReconciler ◀── coordination directory
//!
//! network ──▶ FramedReceiver ──▶ NodeReceiver ──▶ threading model ──▶ containers
//! ```
//!
//! The routing snapshot is immutable and swapped atomically: dispatchers
//! read it lock-free, the reconciler rebuilds it when the directory
//! changes, and senders survive swaps by identity. Inbound frames
//! deserialize in parallel but reach each container in strict arrival
//! order.
//!
//! # Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `switchyard-core` | Addressing, codecs, coordination contracts |
//! | `switchyard-transport` | Wire framing, receiver, senders |
//! | `switchyard` | Routing, dispatch, ordered threading |

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Container-facing job contracts.
pub mod container;

/// The outgoing dispatcher.
pub mod dispatcher;

/// Node-side inbound glue and directory registration.
pub mod node;

/// Self-rescheduling background task.
pub mod persistent;

/// Directory-driven snapshot maintenance.
pub mod reconciler;

/// The immutable routing snapshot.
pub mod snapshot;

/// Routing-strategy contracts and the key-hash default.
pub mod strategy;

/// The ordered per-container threading model.
pub mod threading;

pub use container::{
    ContainerJob, ContainerJobMetadata, MessageContainer, MessageDeliveryJob,
};
pub use dispatcher::{DispatchError, OutgoingDispatcher};
pub use node::{NodeReceiver, NodeRegistration};
pub use persistent::PersistentTask;
pub use reconciler::{RoutingTableReconciler, SharedRoutingState, RETRY_TIMEOUT};
pub use snapshot::{RoutingSnapshot, SnapshotUpdate};
pub use strategy::{ClusterRouter, KeyHashStrategy, RoutingStrategyManager};
pub use threading::{OrderedPerContainerThreadingModel, ThreadingConfig};
