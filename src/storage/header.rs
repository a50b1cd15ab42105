//! # Persisted List Heads
//!
//! The first 256 bytes of the store form the file header: a 16-byte user
//! area the allocator never touches, then 30 big-endian list heads. The
//! heads are the only allocator state that persists outside the pages
//! themselves:
//!
//! ```text
//! Offset  Size   Field
//! ------  ----   ----------------------------------------
//! 16      23*8   pages[rank]: head of the page free-list per page rank
//! 200     7*8    slots[rank]: head of the free-slot list per slot rank
//! ```
//!
//! A head of 0 means the list is empty. Any other value is the store
//! offset of the first page header (for `pages`) or the first freed slot
//! (for `slots`) on that list.
//!
//! ## Validation
//!
//! On open, every head must lie in `[0, store_len - 48]`; anything else
//! means the header was not written by this allocator, or was torn, and
//! the open fails with a corrupt-file error. No deeper scan is performed:
//! the allocator trusts validated persisted state.
//!
//! ## Dirty Tracking
//!
//! `FileHeads` mirrors the block in native integers and carries a dirty
//! flag. Every public allocator operation flushes the block at most once,
//! and only after the pages and nodes it references have been written.

use eyre::{ensure, eyre, Result};
use zerocopy::big_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{HEADS_SIZE, PAGE_RANKS, SLOT_RANKS};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct HeadsBlock {
    pages: [I64; PAGE_RANKS],
    slots: [I64; SLOT_RANKS],
}

const _: () = assert!(std::mem::size_of::<HeadsBlock>() == HEADS_SIZE);

/// In-memory mirror of the persisted list-head block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeads {
    pages: [i64; PAGE_RANKS],
    slots: [i64; SLOT_RANKS],
    dirty: bool,
}

impl FileHeads {
    /// A fresh, all-empty head block, as written to a new store.
    pub fn new() -> Self {
        Self {
            pages: [0; PAGE_RANKS],
            slots: [0; SLOT_RANKS],
            dirty: false,
        }
    }

    /// Decodes a persisted head block, validating every head against
    /// `max`, the largest offset at which a page header could start.
    pub fn decode(bytes: &[u8], max: i64) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADS_SIZE,
            "buffer too small for list heads: {} < {}",
            bytes.len(),
            HEADS_SIZE
        );

        let block = HeadsBlock::ref_from_bytes(&bytes[..HEADS_SIZE])
            .map_err(|e| eyre!("failed to parse list heads: {:?}", e))?;

        let mut heads = Self::new();
        for (rank, head) in block.pages.iter().enumerate() {
            heads.pages[rank] = check(head.get(), max)?;
        }
        for (rank, head) in block.slots.iter().enumerate() {
            heads.slots[rank] = check(head.get(), max)?;
        }
        Ok(heads)
    }

    /// Encodes the block into `buf` exactly as it is persisted.
    pub fn encode(&self, buf: &mut [u8; HEADS_SIZE]) {
        let mut block = HeadsBlock {
            pages: [I64::new(0); PAGE_RANKS],
            slots: [I64::new(0); SLOT_RANKS],
        };
        for (rank, &head) in self.pages.iter().enumerate() {
            block.pages[rank] = I64::new(head);
        }
        for (rank, &head) in self.slots.iter().enumerate() {
            block.slots[rank] = I64::new(head);
        }
        buf.copy_from_slice(block.as_bytes());
    }

    #[inline]
    pub fn page(&self, rank: usize) -> i64 {
        self.pages[rank]
    }

    #[inline]
    pub fn set_page(&mut self, rank: usize, off: i64) {
        self.pages[rank] = off;
        self.dirty = true;
    }

    #[inline]
    pub fn slot(&self, rank: usize) -> i64 {
        self.slots[rank]
    }

    #[inline]
    pub fn set_slot(&mut self, rank: usize, off: i64) {
        self.slots[rank] = off;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

impl Default for FileHeads {
    fn default() -> Self {
        Self::new()
    }
}

fn check(head: i64, max: i64) -> Result<i64> {
    ensure!((0..=max).contains(&head), "corrupted file");
    Ok(head)
}
