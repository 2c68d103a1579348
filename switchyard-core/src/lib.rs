//! Core types and pluggable contracts for the switchyard message plane.
//!
//! This crate holds everything the transport and routing layers agree on:
//! addressing ([`NodeAddress`], [`ClusterId`], [`ContainerAddress`]), the
//! records that cross the wire ([`KeyedMessage`], [`RoutedMessage`]), the
//! directory metadata nodes publish about themselves ([`NodeInformation`]),
//! and the pluggable seams (codec, statistics sink, coordination session).
//!
//! Nothing in here opens a socket or spawns a task.

#![deny(missing_docs)]

mod address;
mod codec;
/// Node configuration keys and coordination path layout.
pub mod config;
mod coordination;
mod info;
mod message;
mod stats;

pub use address::{ClusterId, ContainerAddress, NodeAddress};
pub use codec::{CodecError, JsonCodec, MessageCodec, SharedWireCodec, WireCodec};
pub use config::{NodeConfiguration, RootPaths};
pub use coordination::{CoordinationError, CoordinationSession, DirMode, LocalSession, Watch};
pub use info::{ClusterInformation, NodeInformation};
pub use message::{KeyedMessage, RoutedMessage};
pub use stats::{CountingStatsCollector, NullStatsCollector, StatsCollector};
