//! Message records that cross the dispatch and wire boundaries.

use serde::{Deserialize, Serialize};

/// An application message as handed to the dispatcher.
///
/// The key and payload are opaque byte strings; the application serializes
/// them with whatever codec it registered. `message_types` drives routing:
/// each type maps to the set of downstream clusters that consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedMessage {
    /// Routing key. Messages with equal keys are processed in order by the
    /// same handler instance within each destination cluster.
    pub key: Vec<u8>,
    /// Opaque application payload.
    pub payload: Vec<u8>,
    /// The message types this payload represents.
    pub message_types: Vec<String>,
}

impl KeyedMessage {
    /// Convenience constructor for a single-type message.
    pub fn new(
        key: impl Into<Vec<u8>>,
        payload: impl Into<Vec<u8>>,
        message_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            message_types: vec![message_type.into()],
        }
    }
}

/// The wire-level record: where on the destination node the payload goes.
///
/// `containers` lists the container indexes on the receiving node; a single
/// frame addressed at several co-hosted containers is fanned out locally by
/// the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutedMessage {
    /// Container indexes on the destination node.
    pub containers: Vec<u32>,
    /// Routing key of the original message.
    pub key: Vec<u8>,
    /// Opaque application payload.
    pub payload: Vec<u8>,
}
