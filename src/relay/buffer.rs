//! Relay Buffers
//!
//! Fixed-size read buffers handed out to relay loops. A buffer is owned by
//! exactly one direction of one pair while checked out and goes back to the
//! pool's free list when the guard drops.

use bytes::BytesMut;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Supplies fixed-capacity buffers and recycles released ones
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

/// Buffer usage snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub buffer_size: usize,
    pub outstanding: usize,
    pub idle: usize,
    pub allocated: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            max_idle,
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        })
    }

    /// Check out a buffer, reusing an idle one when available
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.lock_idle().pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                BytesMut::zeroed(self.buffer_size)
            }
        };
        self.outstanding.fetch_add(1, Ordering::Relaxed);

        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        BufferPoolStats {
            buffer_size: self.buffer_size,
            outstanding: self.outstanding.load(Ordering::Relaxed),
            idle: self.lock_idle().len(),
            allocated: self.allocated.load(Ordering::Relaxed),
        }
    }

    fn release(&self, buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::Relaxed);

        let mut idle = self.lock_idle();
        if idle.len() < self.max_idle && buf.len() == self.buffer_size {
            idle.push(buf);
        } else {
            trace!("Dropping released buffer, free list is full");
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<BytesMut>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A checked-out buffer; returned to its pool on drop
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
