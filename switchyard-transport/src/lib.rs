//! Length-prefixed TCP transport for the switchyard message plane.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │             Routing / dispatch                  │
//! ├─────────────────────────────────────────────────┤
//! │  SenderPool (outbound)   FramedReceiver (in)    │
//! │  • one Sender per node   • acceptor + readers   │
//! │  • queue + writer task   • per-reader commands  │
//! │  • backoff reconnect     • disrupt test hook    │
//! ├─────────────────────────────────────────────────┤
//! │  frame: [i16 size | -1 + i32 size] payload      │
//! │  pool:  reusable receive buffers                │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Delivery is at-most-once: a failed write drops the connection's queued
//! messages and the routing layer above decides what that costs.

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

/// Wire frame encoding and incremental decoding.
pub mod frame;

/// Reusable receive-buffer pool.
pub mod pool;

/// Frame-oriented TCP receiver.
pub mod receiver;

/// Resilient per-remote senders.
pub mod sender;

pub use frame::{encode_frame, read_frame, FrameError, LazyFrame, MAX_SHORT_SIZE};
pub use pool::{BufferPool, PooledBuf};
pub use receiver::{FramedReceiver, Listener, ReceiverConfig, ReceiverError};
pub use sender::{Sender, SenderConfig, SenderError, SenderPool};
