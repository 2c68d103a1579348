//! The on-wire frame envelope.
//!
//! Every message on a stream is framed as:
//!
//! ```text
//! [size0: i16 BE]                  // 0 < size0 <= 32767: payload length
//! [size:  i32 BE]                  // only when size0 == -1 (long form)
//! [payload: size bytes]            // opaque, codec-defined
//! ```
//!
//! The short form covers payloads up to 32767 bytes; the `-1` sentinel
//! escapes to a 32-bit length for everything larger. Any other non-positive
//! size, or a size beyond the receiver's limit, marks the stream corrupt and
//! the connection is dropped.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::pool::{BufferPool, PooledBuf};

/// Largest payload the short size form can carry.
pub const MAX_SHORT_SIZE: usize = i16::MAX as usize;

const LONG_FORM_SENTINEL: i16 = -1;

/// Errors from frame encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The decoded size is non-positive or exceeds the receiver's limit.
    /// The connection carrying it cannot be trusted any further.
    #[error("corrupt frame: size {size} outside (0, {limit}]")]
    Corrupt {
        /// The size the peer claimed.
        size: i64,
        /// This receiver's per-frame limit.
        limit: usize,
    },

    /// The payload cannot be represented in the envelope.
    #[error("payload of {size} bytes cannot be framed")]
    Unframeable {
        /// Length of the offending payload.
        size: usize,
    },

    /// The underlying stream failed mid-frame.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Append the framed form of `payload` to `out`.
///
/// # Errors
///
/// Returns [`FrameError::Unframeable`] for an empty payload or one larger
/// than `i32::MAX` bytes.
pub fn encode_frame(payload: &[u8], out: &mut BytesMut) -> Result<(), FrameError> {
    let len = payload.len();
    if len == 0 || len > i32::MAX as usize {
        return Err(FrameError::Unframeable { size: len });
    }

    if len <= MAX_SHORT_SIZE {
        out.reserve(2 + len);
        out.put_i16(len as i16);
    } else {
        out.reserve(6 + len);
        out.put_i16(LONG_FORM_SENTINEL);
        out.put_i32(len as i32);
    }
    out.put_slice(payload);
    Ok(())
}

/// A complete inbound frame whose buffer returns to its pool on drop.
///
/// The payload is read at most once by whoever consumes the frame; holding
/// the `LazyFrame` is what keeps the buffer checked out.
#[derive(Debug)]
pub struct LazyFrame {
    buf: PooledBuf,
    len: usize,
}

impl LazyFrame {
    /// The frame body.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Length of the frame body.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length body. Cannot occur for frames produced by
    /// [`read_frame`]; exists for completeness.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Read one complete frame from `stream`.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. The
/// frame body lands in a buffer drawn from `pool`; dropping the returned
/// [`LazyFrame`] returns it.
///
/// # Errors
///
/// [`FrameError::Corrupt`] when the peer announces an impossible size,
/// [`FrameError::Io`] when the stream fails (including EOF mid-frame).
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    pool: &Arc<BufferPool>,
    max_message_size: usize,
) -> Result<Option<LazyFrame>, FrameError> {
    let mut short = [0u8; 2];
    if stream.read(&mut short[..1]).await? == 0 {
        return Ok(None); // clean EOF between frames
    }
    stream.read_exact(&mut short[1..]).await?;

    let ssize = i16::from_be_bytes(short);
    let size: i64 = if ssize == LONG_FORM_SENTINEL {
        let mut long = [0u8; 4];
        stream.read_exact(&mut long).await?;
        i32::from_be_bytes(long) as i64
    } else {
        ssize as i64
    };

    if size <= 0 || size as usize > max_message_size {
        return Err(FrameError::Corrupt {
            size,
            limit: max_message_size,
        });
    }
    let size = size as usize;

    let mut buf = pool.checkout(size);
    buf.resize(size, 0);
    stream.read_exact(&mut buf[..size]).await?;

    Ok(Some(LazyFrame { buf, len: size }))
}
