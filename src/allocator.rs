//! # Allocator
//!
//! The public allocation API over a [`Storage`] backing store, and the
//! page/slot management behind it.
//!
//! ## Two Regimes
//!
//! Requests of 1..=1024 bytes are rounded to a slot rank (16, 32, ...,
//! 1024 bytes) and served from shared 4 KiB pages. A shared page hands
//! out slots by linear bump allocation first (`brk`); freed slots go onto
//! the per-rank intrusive free-slot list and are reused before any new
//! page is appended.
//!
//! Requests above 1024 bytes get an exclusive page-aligned extent sized
//! to `roundup(48 + size + 8, 4096)`. Free extents are kept on per-rank
//! page free-lists; an oversized extent from the catch-all rank 22 bucket
//! is split and the remainder relinked.
//!
//! ## Crash Safety
//!
//! Within an operation, mutated pages and nodes are flushed before the
//! list-head block, so a crash can leak space (a page appended but not
//! yet referenced) but never leave the heads pointing at unwritten
//! structure. There is no sync barrier between writes; durability beyond
//! OS write ordering is the backing store's problem.
//!
//! ## Failure Semantics
//!
//! Argument errors leave the allocator untouched. I/O errors surface
//! verbatim (wrapped with context) and may leave a partial operation
//! behind. Violated structural invariants -- a rank outside 0..=22, an
//! insert of a still-linked page, a split on a shared page, freeing a
//! page with live slots -- panic: the store no longer matches the format
//! and continuing would corrupt it.

use eyre::{ensure, Result};

use crate::memory::CopyBufferPool;
use crate::storage::{
    page_rank, rank_for, roundup, slot_rank, slot_size, FileHeads, MemNode, MemPage, Storage,
    FILE_HEADER_SIZE, FIRST_PAGE_RANK, HEADS_SIZE, MAX_PAGE_RANK, MAX_SHARED_RANK, MAX_SLOT,
    PAGE_HEADER_SIZE, PAGE_MASK, PAGE_RANKS, PAGE_SIZE, SLOT_CAPS, TAIL_SIZE, USER_AREA_SIZE,
};

/// In-memory allocation counters. Diagnostics only; never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    /// Live allocations: alloc/calloc minus free.
    pub allocs: i64,
    /// Bytes currently occupied by pages in the store.
    pub bytes: i64,
    /// Pages currently extant in the store.
    pub npages: i64,
}

/// Manages allocation of blocks within a backing store.
///
/// The allocator is the sole writer to the store beyond the first 16
/// bytes, which are reserved for the caller (magic numbers and the like)
/// and never read or written here.
#[derive(Debug)]
pub struct Allocator<S: Storage> {
    store: S,
    heads: FileHeads,
    fsize: i64,
    pool: CopyBufferPool,
    stats: Stats,
}

impl<S: Storage> Allocator<S> {
    /// Opens an allocator over `store`.
    ///
    /// A store no longer than the 256-byte file header is initialized
    /// with an empty head block. Anything longer must carry a valid head
    /// block: every list head is checked against the store length and an
    /// out-of-range head fails the open with a corrupt-file error.
    pub fn new(store: S) -> Result<Self> {
        let fsize = store.size()?;
        let mut a = Self {
            store,
            heads: FileHeads::new(),
            fsize,
            pool: CopyBufferPool::new(1),
            stats: Stats::default(),
        };

        if fsize <= FILE_HEADER_SIZE {
            let zero = [0u8; HEADS_SIZE];
            a.store.write_at(&zero, USER_AREA_SIZE)?;
        } else {
            let mut buf = [0u8; HEADS_SIZE];
            let n = a.store.read_at(&mut buf, USER_AREA_SIZE)?;
            ensure!(
                n == HEADS_SIZE,
                "failed to read allocator header: short read {n} < {HEADS_SIZE}"
            );
            a.heads = FileHeads::decode(&buf, fsize - PAGE_HEADER_SIZE)?;
        }

        Ok(a)
    }

    /// Allocates a block large enough for `size` bytes and returns its
    /// offset. The usable region may be larger than requested; see
    /// [`usable_size`](Self::usable_size).
    pub fn alloc(&mut self, size: i64) -> Result<i64> {
        ensure!(size > 0, "invalid argument: alloc({size})");

        self.stats.allocs += 1;
        if size > MAX_SLOT {
            return self.alloc_big(size);
        }

        let rank = slot_rank(size);
        let off = self.heads.page(rank);
        if off != 0 {
            return self.sbrk(off, rank);
        }

        let off = self.heads.page(FIRST_PAGE_RANK);
        if off != 0 {
            return self.retype_free_page(off, rank);
        }

        let off = self.heads.slot(rank);
        if off != 0 {
            return self.alloc_slot(off, rank);
        }

        let mut p = self.new_shared_page(rank)?;
        self.insert_page(&mut p)?;
        p.set_used(1);
        p.set_brk(1);
        p.flush(&mut self.store)?;

        let slot0 = p.slot(0);
        self.flush_heads()?;
        Ok(slot0)
    }

    /// Like [`alloc`](Self::alloc), but the first `size` bytes of the
    /// block are zeroed. Only `size` bytes -- slack up to the usable size
    /// keeps whatever was there.
    pub fn calloc(&mut self, size: i64) -> Result<i64> {
        let off = self.alloc(size)?;

        let mut buf = self.pool.acquire();
        let chunk = size.min(buf.len() as i64) as usize;
        buf[..chunk].fill(0);

        let mut dst = off;
        let mut rem = size;
        while rem != 0 {
            let n = rem.min(chunk as i64) as usize;
            self.store.write_at(&buf[..n], dst)?;
            dst += n as i64;
            rem -= n as i64;
        }
        Ok(off)
    }

    /// Recycles the block at `off`, which must have been returned by
    /// [`alloc`](Self::alloc) or [`realloc`](Self::realloc).
    pub fn free(&mut self, off: i64) -> Result<()> {
        ensure!(
            off >= FILE_HEADER_SIZE + PAGE_HEADER_SIZE,
            "invalid argument: free({off})"
        );

        self.stats.allocs -= 1;
        let mut p = self.open_page(page_start(off))?;
        if p.rank() as usize > MAX_SHARED_RANK {
            self.free_page(p)?;
            return self.flush_heads();
        }

        p.set_used(p.used() - 1);
        self.insert_slot(p.rank() as usize, off)?;
        if p.used() == 0 {
            self.free_page(p)?;
            return self.flush_heads();
        }

        p.flush(&mut self.store)?;
        self.flush_heads()
    }

    /// Resizes the block at `off` to `size` bytes and returns the offset
    /// of the resulting block, which moves only when it must. Contents up
    /// to the minimum of the old and new sizes are preserved; if the
    /// block moved, the old block is freed.
    ///
    /// `realloc(off, 0)` frees the block and returns the sentinel `-1`,
    /// which is never a valid offset.
    pub fn realloc(&mut self, off: i64, size: i64) -> Result<i64> {
        ensure!(
            off >= FILE_HEADER_SIZE + PAGE_HEADER_SIZE,
            "invalid argument: realloc({off})"
        );
        ensure!(size >= 0, "invalid argument: realloc({off}, {size})");

        if size == 0 {
            self.free(off)?;
            return Ok(-1);
        }

        let (old_size, mut p) = self.usable_size_page(off)?;
        if old_size >= size {
            let new_rank = rank_for(size);
            if p.rank() == new_rank as i64 {
                return Ok(off);
            }

            if new_rank > MAX_SHARED_RANK {
                let need = roundup(PAGE_HEADER_SIZE + size + TAIL_SIZE, PAGE_SIZE);
                if p.size() > need {
                    return self.split_page(&mut p, need);
                }
            }
        }

        let new_off = self.alloc(size)?;

        let mut buf = self.pool.acquire();
        let mut rem = old_size.min(size);
        let mut src = off;
        let mut dst = new_off;
        while rem != 0 {
            let chunk = rem.min(buf.len() as i64) as usize;
            let n = self.store.read_at(&mut buf[..chunk], src)?;
            ensure!(
                n == chunk,
                "failed to copy block at offset {src}: short read {n} < {chunk}"
            );
            self.store.write_at(&buf[..chunk], dst)?;
            src += chunk as i64;
            dst += chunk as i64;
            rem -= chunk as i64;
        }
        drop(buf);

        self.free(off)?;
        Ok(new_off)
    }

    /// Reports the usable size of the block at `off`: the slot size for a
    /// block on a shared page, the extent payload for an exclusive page.
    pub fn usable_size(&self, off: i64) -> Result<i64> {
        let (n, _) = self.usable_size_page(off)?;
        Ok(n)
    }

    /// Flushes pending state and releases the backing store.
    pub fn close(mut self) -> Result<()> {
        self.flush_heads()?;
        self.store.close()
    }

    /// Current allocation counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Current byte length of the store as tracked by the allocator.
    pub fn file_size(&self) -> i64 {
        self.fsize
    }

    fn usable_size_page(&self, off: i64) -> Result<(i64, MemPage)> {
        ensure!(
            off >= FILE_HEADER_SIZE + PAGE_HEADER_SIZE,
            "invalid argument: usable_size({off})"
        );

        let p = self.open_page(page_start(off))?;
        let rank = p.rank();
        assert!(
            (0..PAGE_RANKS as i64).contains(&rank),
            "internal error: page at offset {} has rank {rank} out of range",
            p.off()
        );

        if rank as usize <= MAX_SHARED_RANK {
            Ok((slot_size(rank as usize), p))
        } else {
            Ok((p.size() - PAGE_HEADER_SIZE - TAIL_SIZE, p))
        }
    }

    // Bump allocation from the head page of a shared rank's page list.
    fn sbrk(&mut self, off: i64, rank: usize) -> Result<i64> {
        let mut p = self.open_page(off)?;
        assert_eq!(
            p.rank(),
            rank as i64,
            "internal error: bump page at offset {off} has rank {} on list {rank}",
            p.rank()
        );

        p.set_used(p.used() + 1);
        p.set_brk(p.brk() + 1);
        if p.brk() == SLOT_CAPS[rank] {
            self.unlink_page(&mut p)?;
        }
        p.flush(&mut self.store)?;

        let slot = p.slot(p.brk() - 1);
        self.flush_heads()?;
        Ok(slot)
    }

    // A freshly-freed small page sits on pages[7] awaiting reuse; claim it
    // for slot rank `rank`.
    fn retype_free_page(&mut self, off: i64, rank: usize) -> Result<i64> {
        let mut p = self.open_page(off)?;
        self.unlink_page(&mut p)?;

        p.set_rank(rank as i64);
        p.set_used(1);
        p.set_brk(1);
        self.insert_page(&mut p)?;
        p.flush(&mut self.store)?;
        p.set_tail(&mut self.store, 0)?;

        self.flush_heads()?;
        Ok(p.off() + PAGE_HEADER_SIZE)
    }

    // Pop the head of the rank's free-slot list.
    fn alloc_slot(&mut self, off: i64, rank: usize) -> Result<i64> {
        let mut n = self.open_node(off)?;
        self.unlink_node(&mut n, rank)?;

        let mut p = self.open_page(page_start(off))?;
        p.set_used(p.used() + 1);
        p.flush(&mut self.store)?;

        self.flush_heads()?;
        Ok(off)
    }

    fn alloc_big(&mut self, size: i64) -> Result<i64> {
        let need = roundup(PAGE_HEADER_SIZE + size + TAIL_SIZE, PAGE_SIZE);
        let rank = page_rank(need);

        for i in rank..PAGE_RANKS {
            let head = self.heads.page(i);
            if head == 0 {
                continue;
            }

            if i < MAX_PAGE_RANK {
                return self.take_free_page(head);
            }

            // Catch-all bucket: sizes vary, so probe the first two pages
            // for one that fits.
            let mut off = head;
            for _ in 0..2 {
                if off == 0 {
                    break;
                }

                let p = self.open_page(off)?;
                if p.size() >= need {
                    return self.take_catchall_page(p, need);
                }
                off = p.next();
            }
        }

        let mut p = self.new_page(size)?;
        p.flush(&mut self.store)?;

        let payload = p.off() + PAGE_HEADER_SIZE;
        self.flush_heads()?;
        Ok(payload)
    }

    // Any page on a non-catch-all list of rank >= need's rank is big
    // enough by construction; take the head.
    fn take_free_page(&mut self, off: i64) -> Result<i64> {
        let mut p = self.open_page(off)?;
        self.unlink_page(&mut p)?;
        p.flush(&mut self.store)?;
        p.set_tail(&mut self.store, 0)?;

        self.flush_heads()?;
        Ok(p.off() + PAGE_HEADER_SIZE)
    }

    // Claim a rank-22 page, splitting off the surplus as a new free page.
    fn take_catchall_page(&mut self, mut p: MemPage, need: i64) -> Result<i64> {
        self.unlink_page(&mut p)?;

        let rem = p.size() - need;
        p.set_size(need);
        p.set_rank(page_rank(p.size()) as i64);
        p.flush(&mut self.store)?;
        p.set_tail(&mut self.store, 0)?;

        if rem != 0 {
            let mut q = MemPage::new(p.off() + p.size());
            q.set_size(rem);
            q.set_rank(page_rank(rem) as i64);
            self.stats.npages += 1;
            self.insert_page(&mut q)?;
            q.flush(&mut self.store)?;
            q.set_tail(&mut self.store, rem)?;
        }

        self.flush_heads()?;
        Ok(p.off() + PAGE_HEADER_SIZE)
    }

    // In-place right-truncation of an exclusive page: keep `need` bytes,
    // carve the rest into a new free page.
    fn split_page(&mut self, p: &mut MemPage, need: i64) -> Result<i64> {
        assert!(
            p.rank() as usize > MAX_SHARED_RANK,
            "internal error: split of shared page at offset {} (rank {})",
            p.off(),
            p.rank()
        );

        let have = p.size();
        p.set_size(need);
        p.set_rank(page_rank(need) as i64);
        p.flush(&mut self.store)?;
        p.set_tail(&mut self.store, 0)?;

        let mut q = MemPage::new(p.off() + p.size());
        q.set_size(have - need);
        q.set_rank(page_rank(have - need) as i64);
        self.stats.npages += 1;
        self.insert_page(&mut q)?;
        q.flush(&mut self.store)?;
        q.set_tail(&mut self.store, q.size())?;

        let payload = p.off() + PAGE_HEADER_SIZE;
        self.flush_heads()?;
        Ok(payload)
    }

    /// Appends an exclusive page sized for a `size`-byte block. The tail
    /// word is written (as allocated) here; the header flush is the
    /// caller's.
    fn new_page(&mut self, size: i64) -> Result<MemPage> {
        let off = roundup(self.fsize - FILE_HEADER_SIZE, PAGE_SIZE) + FILE_HEADER_SIZE;
        let size = roundup(PAGE_HEADER_SIZE + size + TAIL_SIZE, PAGE_SIZE);

        let mut p = MemPage::new(off);
        p.set_rank(page_rank(size) as i64);
        p.set_size(size);
        self.stats.bytes += size;
        self.fsize = off + size;
        self.stats.npages += 1;

        p.set_tail(&mut self.store, 0)?;
        Ok(p)
    }

    /// Appends a 4 KiB shared page for slot rank `rank`.
    fn new_shared_page(&mut self, rank: usize) -> Result<MemPage> {
        let off = roundup(self.fsize - FILE_HEADER_SIZE, PAGE_SIZE) + FILE_HEADER_SIZE;

        let mut p = MemPage::new(off);
        p.set_rank(rank as i64);
        p.set_size(PAGE_SIZE);
        self.stats.bytes += PAGE_SIZE;
        self.fsize = off + PAGE_SIZE;
        self.stats.npages += 1;

        p.set_tail(&mut self.store, 0)?;
        Ok(p)
    }

    /// Returns a page to the free pool. Tail pages are truncated away,
    /// chaining backwards through free predecessors; middle pages are
    /// relinked on their rank's free-list, shared pages first reverting
    /// to a single free exclusive page.
    fn free_page(&mut self, mut p: MemPage) -> Result<()> {
        assert_eq!(
            p.used(),
            0,
            "internal error: freeing page at offset {} with {} live slots",
            p.off(),
            p.used()
        );

        if p.off() + p.size() == self.fsize {
            return self.free_last_page(p);
        }

        if p.rank() as usize <= MAX_SHARED_RANK {
            self.free_slots(&p)?;
            self.unlink_page(&mut p)?;
            p.set_brk(0);
            p.set_rank(FIRST_PAGE_RANK as i64);
        }

        self.insert_page(&mut p)?;
        p.flush(&mut self.store)?;
        p.set_tail(&mut self.store, p.size())
    }

    fn free_last_page(&mut self, mut p: MemPage) -> Result<()> {
        loop {
            if p.rank() as usize <= MAX_SHARED_RANK {
                self.free_slots(&p)?;
            }
            self.unlink_page(&mut p)?;
            p.flush(&mut self.store)?;

            self.store.truncate(p.off())?;
            self.fsize = p.off();
            self.stats.npages -= 1;
            self.stats.bytes -= p.size();

            if p.off() > FILE_HEADER_SIZE {
                // A nonzero tail word just below us means the previous
                // page is free too; keep truncating.
                let prev_size = self.read_word(p.off() - TAIL_SIZE)?;
                if prev_size != 0 {
                    p = self.open_page(p.off() - prev_size)?;
                    continue;
                }
            }
            return Ok(());
        }
    }

    // Unthread every recorded slot of a dying shared page from its rank's
    // free-slot list.
    fn free_slots(&mut self, p: &MemPage) -> Result<()> {
        assert_eq!(
            p.used(),
            0,
            "internal error: releasing slots of page at offset {} with {} live slots",
            p.off(),
            p.used()
        );

        for i in 0..p.brk() {
            let mut n = self.open_node(p.slot(i))?;
            self.unlink_node(&mut n, p.rank() as usize)?;
            n.flush(&mut self.store)?;
        }
        Ok(())
    }

    fn insert_page(&mut self, p: &mut MemPage) -> Result<()> {
        assert!(
            p.prev() == 0 && p.next() == 0,
            "internal error: inserting linked page at offset {} (prev {:#x}, next {:#x})",
            p.off(),
            p.prev(),
            p.next()
        );

        p.set_next(self.heads.page(p.rank() as usize));
        if p.next() != 0 {
            let mut next = self.open_page(p.next())?;
            next.set_prev(p.off());
            next.flush(&mut self.store)?;
        }
        self.heads.set_page(p.rank() as usize, p.off());
        Ok(())
    }

    fn unlink_page(&mut self, p: &mut MemPage) -> Result<()> {
        if p.prev() != 0 {
            let mut prev = self.open_page(p.prev())?;
            prev.set_next(p.next());
            prev.flush(&mut self.store)?;
        }

        if p.next() != 0 {
            let mut next = self.open_page(p.next())?;
            next.set_prev(p.prev());
            next.flush(&mut self.store)?;
        }

        let rank = p.rank() as usize;
        if self.heads.page(rank) == p.off() {
            self.heads.set_page(rank, p.next());
        }

        p.set_prev(0);
        p.set_next(0);
        Ok(())
    }

    // Push the freed slot at `off` as the new head of its rank's list.
    fn insert_slot(&mut self, rank: usize, off: i64) -> Result<()> {
        let mut node = MemNode::new(off);
        node.set_prev(0);
        node.set_next(self.heads.slot(rank));
        if node.next() != 0 {
            let mut next = self.open_node(node.next())?;
            next.set_prev(off);
            next.flush(&mut self.store)?;
        }
        self.heads.set_slot(rank, off);
        node.flush(&mut self.store)
    }

    fn unlink_node(&mut self, n: &mut MemNode, rank: usize) -> Result<()> {
        if n.prev() != 0 {
            let mut prev = self.open_node(n.prev())?;
            prev.set_next(n.next());
            prev.flush(&mut self.store)?;
        }

        if n.next() != 0 {
            let mut next = self.open_node(n.next())?;
            next.set_prev(n.prev());
            next.flush(&mut self.store)?;
        }

        if self.heads.slot(rank) == n.off() {
            self.heads.set_slot(rank, n.next());
        }
        Ok(())
    }

    fn open_page(&self, off: i64) -> Result<MemPage> {
        MemPage::open(&self.store, off)
    }

    fn open_node(&self, off: i64) -> Result<MemNode> {
        MemNode::open(&self.store, off)
    }

    fn read_word(&self, off: i64) -> Result<i64> {
        let mut buf = [0u8; TAIL_SIZE as usize];
        let n = self.store.read_at(&mut buf, off)?;
        ensure!(
            n == buf.len(),
            "failed to read tail word at offset {off}: short read"
        );
        Ok(i64::from_be_bytes(buf))
    }

    fn flush_heads(&mut self) -> Result<()> {
        if !self.heads.is_dirty() {
            return Ok(());
        }

        let mut buf = [0u8; HEADS_SIZE];
        self.heads.encode(&mut buf);
        self.store.write_at(&buf, USER_AREA_SIZE)?;
        self.heads.mark_clean();
        Ok(())
    }
}

/// Offset of the header of the page containing payload offset `off`.
fn page_start(off: i64) -> i64 {
    ((off - FILE_HEADER_SIZE) & !PAGE_MASK) + FILE_HEADER_SIZE
}
