//! # Free-Slot List Nodes
//!
//! Freed slots on shared pages are threaded onto per-rank doubly-linked
//! lists. The lists are intrusive: each node is 16 bytes written over the
//! first bytes of the freed slot itself, which is always valid because no
//! slot is smaller than 16 bytes.
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//! 0       8     prev
//! 8       8     next
//! ```
//!
//! A node exists only while its slot is free; reallocating the slot
//! simply stops treating those bytes as a node. Like pages, nodes are
//! value types: open reads from the store, setters mark dirty, flush
//! writes back.

use eyre::{ensure, eyre, Result};
use zerocopy::big_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Storage, NODE_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    prev: I64,
    next: I64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_SIZE as usize);

impl NodeHeader {
    pub fn zeroed() -> Self {
        Self {
            prev: I64::new(0),
            next: I64::new(0),
        }
    }

    be_i64_accessors! {
        prev,
        next,
    }
}

/// A free-slot list node read into memory, tied to its slot offset.
#[derive(Debug, Clone)]
pub struct MemNode {
    off: i64,
    dirty: bool,
    header: NodeHeader,
}

impl MemNode {
    /// A fresh, detached node at `off`. Nothing is written until `flush`.
    pub fn new(off: i64) -> Self {
        Self {
            off,
            dirty: false,
            header: NodeHeader::zeroed(),
        }
    }

    /// Reads the node overlaid on the freed slot at `off`.
    pub fn open<S: Storage>(store: &S, off: i64) -> Result<Self> {
        let mut buf = [0u8; NODE_SIZE as usize];
        let n = store.read_at(&mut buf, off)?;
        ensure!(
            n == buf.len(),
            "failed to read free-slot node at offset {off}: short read {n} < {}",
            buf.len()
        );

        let header = NodeHeader::read_from_bytes(&buf)
            .map_err(|e| eyre!("failed to parse free-slot node at offset {off}: {:?}", e))?;

        Ok(Self {
            off,
            dirty: false,
            header,
        })
    }

    pub fn flush<S: Storage>(&mut self, store: &mut S) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        store.write_at(self.header.as_bytes(), self.off)?;
        self.dirty = false;
        Ok(())
    }

    #[inline]
    pub fn off(&self) -> i64 {
        self.off
    }

    #[inline]
    pub fn prev(&self) -> i64 {
        self.header.prev()
    }

    #[inline]
    pub fn next(&self) -> i64 {
        self.header.next()
    }

    /// Setters mark the node dirty unconditionally: a freshly-freed slot
    /// holds arbitrary user bytes, so even writing zero must reach disk.
    pub fn set_prev(&mut self, n: i64) {
        self.header.set_prev(n);
        self.dirty = true;
    }

    pub fn set_next(&mut self, n: i64) {
        self.header.set_next(n);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStorage;
    use tempfile::tempdir;

    #[test]
    fn node_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<NodeHeader>(), 16);
    }

    #[test]
    fn flush_then_open_round_trips() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        let mut node = MemNode::new(304);
        node.set_prev(320);
        node.set_next(336);

        node.flush(&mut store).unwrap();
        let reread = MemNode::open(&store, 304).unwrap();

        assert_eq!(reread.prev(), 320);
        assert_eq!(reread.next(), 336);
    }

    #[test]
    fn set_to_zero_still_flushes() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        store.write_at(&[0xFFu8; 16], 304).unwrap();

        let mut node = MemNode::new(304);
        node.set_prev(0);
        node.set_next(0);
        node.flush(&mut store).unwrap();

        let reread = MemNode::open(&store, 304).unwrap();
        assert_eq!(reread.prev(), 0);
        assert_eq!(reread.next(), 0);
    }

    #[test]
    fn fields_are_big_endian_prev_then_next() {
        let dir = tempdir().unwrap();
        let mut store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        let mut node = MemNode::new(0);
        node.set_prev(1);
        node.set_next(2);
        node.flush(&mut store).unwrap();

        let mut buf = [0u8; 16];
        store.read_at(&mut buf, 0).unwrap();

        assert_eq!(buf[7], 1);
        assert_eq!(buf[15], 2);
    }
}
