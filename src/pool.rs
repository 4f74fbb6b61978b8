//! Reusable frame buffers.
use std::sync::{Mutex, PoisonError};

use bytes::BytesMut;

/// Initial capacity of a freshly allocated frame buffer.
const INITIAL_CAPACITY: usize = 256;
/// Buffers that grew beyond this are dropped instead of pooled.
const MAX_POOLED_CAPACITY: usize = 64 * 1024;

/// A small pool of frame buffers shared by the encoder, the writer loop and the reader loop.
///
/// Outbound frames are encoded into a rented buffer and recycled once the transport has written
/// them; inbound frames are read into a rented buffer and recycled once decoded.
#[derive(Debug)]
pub struct FramePool {
    slots: Mutex<Vec<BytesMut>>,
    max_pooled: usize,
}

impl FramePool {
    /// Creates a pool that retains at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    /// Takes an empty buffer from the pool, allocating one if none is idle.
    pub fn rent(&self) -> BytesMut {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(INITIAL_CAPACITY))
    }

    /// Returns a buffer to the pool. Oversized buffers and buffers beyond the pool's limit are
    /// dropped.
    pub fn recycle(&self, mut buf: BytesMut) {
        if buf.capacity() > MAX_POOLED_CAPACITY {
            return;
        }
        buf.clear();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.len() < self.max_pooled {
            slots.push(buf);
        }
    }

    /// Number of idle buffers currently held.
    pub fn pooled(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new(4)
    }
}
