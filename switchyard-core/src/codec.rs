//! Pluggable payload serialization.
//!
//! The [`MessageCodec`] trait lets deployments bring their own format while
//! the crate ships [`JsonCodec`] as a readable default. Codecs are identified
//! by a stable [`MessageCodec::id`] string which nodes advertise in their
//! [`NodeAddress`](crate::NodeAddress) so peers can detect mismatches.
//!
//! # Example
//!
//! ```
//! use serde::{Serialize, Deserialize};
//! use switchyard_core::{JsonCodec, MessageCodec};
//!
//! #[derive(Serialize, Deserialize, Debug, PartialEq)]
//! struct Ping { seq: u32 }
//!
//! let codec = JsonCodec;
//! let bytes = codec.encode(&Ping { seq: 1 }).expect("encode");
//! let back: Ping = codec.decode(&bytes).expect("decode");
//! assert_eq!(back, Ping { seq: 1 });
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::RoutedMessage;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Failed to decode bytes to a message.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Pluggable message serialization format.
///
/// Implementations must be deterministic and self-describing for the types
/// they are registered with.
pub trait MessageCodec: Clone + Send + Sync + 'static {
    /// Stable identifier advertised to peers.
    fn id(&self) -> &'static str;

    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn id(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

/// Object-safe view of a codec specialized to the wire record.
///
/// The transport stores codecs behind `Arc<dyn WireCodec>` so senders and
/// receivers need not be generic over the codec type.
pub trait WireCodec: Send + Sync + 'static {
    /// Stable identifier advertised to peers.
    fn id(&self) -> &'static str;

    /// Encode a [`RoutedMessage`] for transmission.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode_message(&self, msg: &RoutedMessage) -> Result<Vec<u8>, CodecError>;

    /// Decode a received frame body into a [`RoutedMessage`].
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode_message(&self, buf: &[u8]) -> Result<RoutedMessage, CodecError>;
}

impl<C: MessageCodec> WireCodec for C {
    fn id(&self) -> &'static str {
        MessageCodec::id(self)
    }

    fn encode_message(&self, msg: &RoutedMessage) -> Result<Vec<u8>, CodecError> {
        self.encode(msg)
    }

    fn decode_message(&self, buf: &[u8]) -> Result<RoutedMessage, CodecError> {
        self.decode(buf)
    }
}

/// Convenience alias for a shared, type-erased codec.
pub type SharedWireCodec = Arc<dyn WireCodec>;
