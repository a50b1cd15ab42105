//! # fileheap - Persistent Block Allocator
//!
//! fileheap manages allocation and deallocation of variable-sized byte
//! regions ("blocks") inside a single file-like backing store. Clients get
//! plain integer offsets; the allocator guarantees those offsets refer to
//! disjoint, usable regions of at least the requested size, and supports
//! freeing and resizing them in place or by relocation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use fileheap::{Allocator, FileStorage};
//!
//! let store = FileStorage::open("./data.heap")?;
//! let mut heap = Allocator::new(store)?;
//!
//! let off = heap.alloc(100)?;
//! // ... write up to usable_size(off) bytes at `off` through your own I/O ...
//! let off = heap.realloc(off, 4000)?;
//! heap.free(off)?;
//! heap.close()?;
//! ```
//!
//! ## Architecture
//!
//! fileheap uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │      Public API (Allocator)          │
//! ├─────────────────────────────────────┤
//! │  Page manager     │  Slot manager    │
//! │  (extents, split, │  (shared pages,  │
//! │   free lists)     │   slot lists)    │
//! ├─────────────────────────────────────┤
//! │   Big-endian on-disk codec (zerocopy)│
//! ├─────────────────────────────────────┤
//! │   Storage trait (positional I/O)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! The store begins with a 256-byte header: 16 user bytes the allocator
//! never touches, then 30 big-endian list heads (23 page free-lists keyed
//! by page rank, 7 slot free-lists keyed by slot rank). Pages follow on
//! 4 KiB boundaries measured from the end of the header:
//!
//! ```text
//! offset 0       16 user bytes + 240-byte list-head block
//! offset 256     page 0 (one or more 4 KiB units)
//! offset 256+4k  page 1
//! ...
//! ```
//!
//! Small requests (≤ 1024 bytes) are carved as fixed-size slots out of
//! shared 4 KiB pages; larger requests get an exclusive page-aligned
//! extent. Freed space is tracked by intrusive doubly-linked lists whose
//! nodes live inside the freed blocks themselves, and trailing free pages
//! are returned to the OS by truncation.
//!
//! ## Concurrency
//!
//! The allocator is a single-writer, single-threaded object. Callers must
//! serialize operations; there is no internal locking and no suspendable
//! operation.
//!
//! ## Module Overview
//!
//! - [`storage`]: positional-I/O backing store contract, on-disk layout
//!   constants, header/page/node codecs, size-class math
//! - [`memory`]: pooled scratch buffers for zero-fill and block copies
//! - [`allocator`]: the public allocation API and free-list management

#[macro_use]
mod macros;

pub mod allocator;
pub mod memory;
pub mod storage;

pub use allocator::{Allocator, Stats};
pub use storage::{FileStorage, Storage};
