//! # Memory Module
//!
//! Pooled scratch buffers for the allocator's bulk data paths. Zero-fill
//! (`calloc`) and block relocation (`realloc`) stream through a reusable
//! 1 MiB staging buffer instead of allocating per call; buffers return to
//! the pool when dropped.
//!
//! Header, page, and node staging does not go through the pool -- those
//! records are 8 to 240 bytes and live in fixed stack arrays.

mod copy_buffer;

pub use copy_buffer::{CopyBufferPool, PooledCopyBuffer, COPY_BUFFER_SIZE};
