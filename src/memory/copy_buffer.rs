//! # Copy Buffer Pool
//!
//! Pre-allocated pool of 1 MiB buffers staging `calloc` zero-fill and
//! `realloc` block copies.
//!
//! ## Usage
//!
//! ```ignore
//! let pool = CopyBufferPool::new(1);
//!
//! let mut buf = pool.acquire();
//! buf[..chunk].fill(0);
//! // ... write chunks through the store ...
//! drop(buf); // returns to the pool
//! ```
//!
//! ## Design
//!
//! The allocator is single-writer, so a single mutex-guarded free list is
//! enough; an empty pool falls back to a fresh allocation rather than
//! blocking. `PooledCopyBuffer` uses `ManuallyDrop` so the buffer can be
//! handed back to the pool from `Drop` without an `Option` dance.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

/// Staging buffer size for calloc and realloc, 1 MiB.
pub const COPY_BUFFER_SIZE: usize = 1 << 20;

/// A pool of reusable copy buffers.
///
/// Buffers are returned to the pool when dropped. Cloning the pool yields
/// another handle to the same buffers.
#[derive(Debug)]
pub struct CopyBufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    buffers: Mutex<Vec<Box<[u8]>>>,
}

impl CopyBufferPool {
    /// Creates a pool with `initial_capacity` pre-allocated buffers.
    pub fn new(initial_capacity: usize) -> Self {
        let buffers = (0..initial_capacity)
            .map(|_| vec![0u8; COPY_BUFFER_SIZE].into_boxed_slice())
            .collect();

        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(buffers),
            }),
        }
    }

    /// Acquires a buffer, allocating a fresh one if the pool is empty.
    /// Contents are unspecified; callers zero what they need.
    pub fn acquire(&self) -> PooledCopyBuffer {
        let buffer = self.inner.buffers.lock().pop();
        let buffer = buffer.unwrap_or_else(|| vec![0u8; COPY_BUFFER_SIZE].into_boxed_slice());

        PooledCopyBuffer {
            buffer: ManuallyDrop::new(buffer),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers currently resting in the pool.
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().len()
    }
}

impl Clone for CopyBufferPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A copy buffer that returns to its pool when dropped.
pub struct PooledCopyBuffer {
    buffer: ManuallyDrop<Box<[u8]>>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledCopyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledCopyBuffer")
            .field("len", &self.buffer.len())
            .finish()
    }
}

impl Deref for PooledCopyBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer
    }
}

impl DerefMut for PooledCopyBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }
}

impl Drop for PooledCopyBuffer {
    fn drop(&mut self) {
        // SAFETY: take is called exactly once, here, and self is never
        // used again after Drop.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        self.pool.buffers.lock().push(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pool_preallocates_buffers() {
        let pool = CopyBufferPool::new(2);

        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn acquire_takes_from_pool() {
        let pool = CopyBufferPool::new(1);

        let buf = pool.acquire();

        assert_eq!(buf.len(), COPY_BUFFER_SIZE);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn drop_returns_buffer_to_pool() {
        let pool = CopyBufferPool::new(1);

        let buf = pool.acquire();
        drop(buf);

        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn empty_pool_allocates_fresh_buffer() {
        let pool = CopyBufferPool::new(0);

        let buf = pool.acquire();
        drop(buf);

        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn buffer_is_writable_through_deref() {
        let pool = CopyBufferPool::new(1);
        let mut buf = pool.acquire();

        buf[0] = 42;
        buf[COPY_BUFFER_SIZE - 1] = 7;

        assert_eq!(buf[0], 42);
        assert_eq!(buf[COPY_BUFFER_SIZE - 1], 7);
    }

    #[test]
    fn clone_shares_the_same_pool() {
        let pool = CopyBufferPool::new(1);
        let clone = pool.clone();

        let buf = pool.acquire();
        assert_eq!(clone.available(), 0);
        drop(buf);

        assert_eq!(clone.available(), 1);
    }
}
