//! Reusable receive buffers.
//!
//! Readers draw a buffer per frame; ownership travels with the frame to the
//! listener and the buffer comes back to the pool when the frame is dropped.
//! The pool never shrinks; a quiet connection costs nothing, a busy one
//! reuses the same few allocations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Shared pool of receive buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw a buffer with at least `capacity` bytes available.
    pub fn checkout(self: &Arc<Self>, capacity: usize) -> PooledBuf {
        let mut buf = {
            let mut free = self.free.lock().expect("buffer pool lock poisoned");
            free.pop().unwrap_or_default()
        };
        if buf.capacity() < capacity {
            buf.reserve(capacity);
        }
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        PooledBuf {
            buf,
            pool: Arc::clone(self),
        }
    }

    /// Buffers currently lent out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Buffers parked in the pool.
    pub fn pooled(&self) -> usize {
        self.free.lock().expect("buffer pool lock poisoned").len()
    }

    fn give_back(&self, mut buf: BytesMut) {
        buf.clear();
        self.free
            .lock()
            .expect("buffer pool lock poisoned")
            .push(buf);
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A buffer on loan from a [`BufferPool`]; returned on drop.
#[derive(Debug)]
pub struct PooledBuf {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl std::ops::Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl std::ops::DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(buf);
    }
}
