//! # Page Header and In-Memory Page
//!
//! Every page in the store begins with a 48-byte header:
//!
//! ```text
//! Offset  Size  Field   Description
//! ------  ----  -----   ----------------------------------------
//! 0       8     brk     shared page: slots carved so far by bump allocation
//! 8       8     prev    previous page on this rank's free-list (0 = none)
//! 16      8     next    next page on this rank's free-list (0 = none)
//! 24      8     rank    size class; <= 6 shared, >= 7 exclusive
//! 32      8     size    total on-disk span, a multiple of 4096
//! 40      8     used    shared page: currently-allocated slot count
//! ```
//!
//! The final 8 bytes of every page are the tail word: equal to `size`
//! while the page is free, 0 while its payload is allocated. Truncation
//! peeks at the tail word of the preceding page to decide whether to keep
//! shrinking the store.
//!
//! ## Value Semantics
//!
//! `MemPage` is a plain value: opening a page reads the header from the
//! store, mutation happens on the value and sets a dirty flag, and
//! `flush` writes the header back once. There is no page cache -- every
//! open re-reads the store, and two live `MemPage` values for the same
//! offset would be a logic error in the caller.

use eyre::{ensure, eyre, Result};
use zerocopy::big_endian::I64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use super::{Storage, ALLOC_ALIGN, PAGE_HEADER_SIZE, TAIL_SIZE};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PageHeader {
    brk: I64,
    prev: I64,
    next: I64,
    rank: I64,
    size: I64,
    used: I64,
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE as usize);

impl PageHeader {
    pub fn zeroed() -> Self {
        Self {
            brk: I64::new(0),
            prev: I64::new(0),
            next: I64::new(0),
            rank: I64::new(0),
            size: I64::new(0),
            used: I64::new(0),
        }
    }

    be_i64_accessors! {
        brk,
        prev,
        next,
        rank,
        size,
        used,
    }
}

/// A page header read into memory, tied to its store offset.
#[derive(Debug, Clone)]
pub struct MemPage {
    off: i64,
    dirty: bool,
    header: PageHeader,
}

impl MemPage {
    /// A fresh page value at `off` with a zeroed header. Used when
    /// appending or carving pages; nothing is written until `flush`.
    pub fn new(off: i64) -> Self {
        Self {
            off,
            dirty: false,
            header: PageHeader::zeroed(),
        }
    }

    /// Reads the page header at `off` from the store.
    pub fn open<S: Storage>(store: &S, off: i64) -> Result<Self> {
        let mut buf = [0u8; PAGE_HEADER_SIZE as usize];
        let n = store.read_at(&mut buf, off)?;
        ensure!(
            n == buf.len(),
            "failed to read page header at offset {off}: short read {n} < {}",
            buf.len()
        );

        let header = PageHeader::read_from_bytes(&buf)
            .map_err(|e| eyre!("failed to parse page header at offset {off}: {:?}", e))?;

        Ok(Self {
            off,
            dirty: false,
            header,
        })
    }

    /// Writes the header back if any setter ran since the last flush.
    pub fn flush<S: Storage>(&mut self, store: &mut S) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        store.write_at(self.header.as_bytes(), self.off)?;
        self.dirty = false;
        Ok(())
    }

    /// Writes the page's tail word: `size` marks the page free, 0 marks
    /// its payload allocated. Always hits the store directly.
    pub fn set_tail<S: Storage>(&self, store: &mut S, word: i64) -> Result<()> {
        store.write_at(&word.to_be_bytes(), self.off + self.header.size() - TAIL_SIZE)
    }

    #[inline]
    pub fn off(&self) -> i64 {
        self.off
    }

    /// Store offset of slot `i` on this shared page.
    #[inline]
    pub fn slot(&self, i: i64) -> i64 {
        self.off + PAGE_HEADER_SIZE + (i * (ALLOC_ALIGN << self.header.rank()))
    }

    #[inline]
    pub fn brk(&self) -> i64 {
        self.header.brk()
    }

    #[inline]
    pub fn prev(&self) -> i64 {
        self.header.prev()
    }

    #[inline]
    pub fn next(&self) -> i64 {
        self.header.next()
    }

    #[inline]
    pub fn rank(&self) -> i64 {
        self.header.rank()
    }

    #[inline]
    pub fn size(&self) -> i64 {
        self.header.size()
    }

    #[inline]
    pub fn used(&self) -> i64 {
        self.header.used()
    }

    pub fn set_brk(&mut self, n: i64) {
        self.header.set_brk(n);
        self.dirty = true;
    }

    pub fn set_prev(&mut self, n: i64) {
        self.header.set_prev(n);
        self.dirty = true;
    }

    pub fn set_next(&mut self, n: i64) {
        self.header.set_next(n);
        self.dirty = true;
    }

    pub fn set_rank(&mut self, n: i64) {
        self.header.set_rank(n);
        self.dirty = true;
    }

    pub fn set_size(&mut self, n: i64) {
        self.header.set_size(n);
        self.dirty = true;
    }

    pub fn set_used(&mut self, n: i64) {
        self.header.set_used(n);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStorage, PAGE_SIZE};
    use tempfile::tempdir;

    fn test_store() -> (tempfile::TempDir, FileStorage) {
        let dir = tempdir().unwrap();
        let store = FileStorage::open(dir.path().join("heap.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn page_header_size_is_48_bytes() {
        assert_eq!(std::mem::size_of::<PageHeader>(), 48);
    }

    #[test]
    fn header_fields_are_big_endian() {
        let mut header = PageHeader::zeroed();
        header.set_rank(0x0102030405060708);

        let bytes = header.as_bytes();

        assert_eq!(&bytes[24..32], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn flush_then_open_round_trips() {
        let (_dir, mut store) = test_store();
        let mut page = MemPage::new(256);
        page.set_brk(5);
        page.set_prev(4352);
        page.set_next(8448);
        page.set_rank(2);
        page.set_size(PAGE_SIZE);
        page.set_used(3);

        page.flush(&mut store).unwrap();
        let reread = MemPage::open(&store, 256).unwrap();

        assert_eq!(reread.brk(), 5);
        assert_eq!(reread.prev(), 4352);
        assert_eq!(reread.next(), 8448);
        assert_eq!(reread.rank(), 2);
        assert_eq!(reread.size(), PAGE_SIZE);
        assert_eq!(reread.used(), 3);
    }

    #[test]
    fn flush_without_mutation_writes_nothing() {
        let (_dir, mut store) = test_store();
        let mut page = MemPage::new(256);

        page.flush(&mut store).unwrap();

        assert_eq!(crate::storage::Storage::size(&store).unwrap(), 0);
    }

    #[test]
    fn open_past_end_of_store_fails() {
        let (_dir, store) = test_store();

        let result = MemPage::open(&store, 256);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("short read"));
    }

    #[test]
    fn slot_offsets_scale_with_rank() {
        let mut page = MemPage::new(256);
        page.set_rank(0);
        assert_eq!(page.slot(0), 304);
        assert_eq!(page.slot(1), 320);
        assert_eq!(page.slot(251), 304 + 251 * 16);

        page.set_rank(6);
        assert_eq!(page.slot(0), 304);
        assert_eq!(page.slot(1), 304 + 1024);
    }

    #[test]
    fn set_tail_writes_word_at_end_of_page() {
        let (_dir, mut store) = test_store();
        let mut page = MemPage::new(256);
        page.set_size(PAGE_SIZE);
        page.flush(&mut store).unwrap();

        page.set_tail(&mut store, PAGE_SIZE).unwrap();

        let mut buf = [0u8; 8];
        store.read_at(&mut buf, 256 + PAGE_SIZE - 8).unwrap();
        assert_eq!(i64::from_be_bytes(buf), PAGE_SIZE);
    }
}
