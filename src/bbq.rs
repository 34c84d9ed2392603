//! Block-based bounded MPMC queue.
//!
//! The ring is divided into blocks of `B` entries. Producers and consumers
//! each work a *head* block and move to the next one only when the current
//! block is exhausted, so the common case is a single `fetch_add` on a
//! block-local cursor rather than a CAS retry on a shared index.
//!
//! Each block carries four cursors, every one a packed `(version, offset)`
//! pair: `allocated`/`committed` for the producer side and
//! `reserved`/`consumed` for the consumer side. The offset counts entries
//! claimed (or published, reserved, drained) in the current lap; the version
//! counts laps of the whole ring and gates block reuse: a producer may only
//! open a block whose previous lap has been fully consumed, and a consumer
//! may only enter a block whose current lap has been opened. Cursors move
//! exclusively upward, via `fetch_add` or a CAS-loop `fetch_max`, so a
//! stalled helper can never rewind another thread's progress.
//!
//! The design follows "BBQ: A Block-based Bounded Queue" (USENIX ATC '22),
//! in retry mode: a full queue rejects the push instead of dropping the
//! oldest block.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicU64, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::common::backoff::Backoff;

/// A packed block cursor: laps in the high word, entries in the low word.
///
/// The 32-bit version is assumed never to wrap: that takes 2^32 full laps
/// of the ring within the lifetime of one queue.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct Cursor {
    offset: u32,
    version: u32,
}

impl Cursor {
    #[inline]
    fn new(offset: u32, version: u32) -> Self {
        Self { offset, version }
    }

    #[inline]
    fn pack(self) -> u64 {
        ((self.version as u64) << 32) | self.offset as u64
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        Self {
            offset: raw as u32,
            version: (raw >> 32) as u32,
        }
    }
}

struct Block<T> {
    allocated: CachePadded<AtomicU64>,
    committed: CachePadded<AtomicU64>,
    reserved: CachePadded<AtomicU64>,
    consumed: CachePadded<AtomicU64>,
    entries: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Block<T> {
    /// Blocks other than the first start fully done at version 0, so the
    /// producer's first lap opens them through the version gate like any
    /// later lap.
    fn new(block_size: usize, exhausted: bool) -> Self {
        let start = if exhausted { block_size as u64 } else { 0 };
        Self {
            allocated: CachePadded::new(AtomicU64::new(start)),
            committed: CachePadded::new(AtomicU64::new(start)),
            reserved: CachePadded::new(AtomicU64::new(start)),
            consumed: CachePadded::new(AtomicU64::new(start)),
            entries: (0..block_size)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }
}

enum Reserve {
    Success { offset: u32 },
    Fail,
    Busy,
    BlockDone,
}

enum Advance {
    Advanced,
    Fail,
    Busy,
}

/// A lock-free bounded queue of `N` entries grouped into blocks of `B`.
///
/// `N` and `B` must be powers of two with at least two blocks
/// (`N / B >= 2`). A good default block size keeps
/// `log2(N / B) ≈ max(1, log2(N) / 4)`; see
/// [`default_block_size`](Self::default_block_size).
pub struct Bbq<T, const N: usize, const B: usize> {
    blocks: Box<[Block<T>]>,
    phead: CachePadded<AtomicU64>,
    chead: CachePadded<AtomicU64>,
}

unsafe impl<T: Send, const N: usize, const B: usize> Send for Bbq<T, N, B> {}
unsafe impl<T: Send, const N: usize, const B: usize> Sync for Bbq<T, N, B> {}

impl<T, const N: usize, const B: usize> Default for Bbq<T, N, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize, const B: usize> Bbq<T, N, B> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "capacity must be a power of two");
        assert!(B.is_power_of_two(), "block size must be a power of two");
        assert!(N / B >= 2, "the ring needs at least two blocks");

        let blocks = (0..N / B).map(|i| Block::new(B, i != 0)).collect();
        Self {
            blocks,
            phead: CachePadded::new(AtomicU64::new(0)),
            chead: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// The block size the capacity alone would suggest:
    /// `log2(blocks) = max(1, log2(capacity) / 4)`.
    pub const fn default_block_size(capacity: usize) -> usize {
        let log2_capacity = capacity.trailing_zeros() as usize;
        let log2_blocks = if log2_capacity / 4 > 1 {
            log2_capacity / 4
        } else {
            1
        };
        capacity >> log2_blocks
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        let mut backoff = Backoff::new();
        loop {
            let (head, block) = self.head_block(&self.phead);
            match self.allocate_entry(block) {
                Some(offset) => {
                    // Exclusive claim on the entry: publish the value, then
                    // the commit count.
                    unsafe { (*block.entries[offset as usize].get()).write(value) };
                    block.committed.fetch_add(1, Ordering::AcqRel);
                    return Ok(());
                }
                None => match self.advance_phead(head) {
                    Advance::Advanced => continue,
                    Advance::Fail => return Err(value),
                    Advance::Busy => {}
                },
            }
            backoff.spin();
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            let (head, block) = self.head_block(&self.chead);
            match self.reserve_entry(block, &mut backoff) {
                Reserve::Success { offset } => {
                    let value = unsafe { (*block.entries[offset as usize].get()).assume_init_read() };
                    block.consumed.fetch_add(1, Ordering::AcqRel);
                    return Some(value);
                }
                Reserve::Fail => return None,
                Reserve::Busy => {}
                Reserve::BlockDone => {
                    if !self.advance_chead(head) {
                        return None;
                    }
                    continue;
                }
            }
            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        let (head, block) = self.head_block(&self.chead);
        let reserved = Cursor::unpack(block.reserved.load(Ordering::Acquire));
        if reserved.offset >= B as u32 {
            // Consumer side of this block is done; anything further hinges
            // on the next block having been opened for the next lap.
            let next = self.next_block(head);
            let committed = Cursor::unpack(next.committed.load(Ordering::Acquire));
            return committed.version != head.version.wrapping_add(1);
        }
        let committed = Cursor::unpack(block.committed.load(Ordering::Acquire));
        committed.offset == reserved.offset
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn head_block(&self, head: &AtomicU64) -> (Cursor, &Block<T>) {
        let cursor = Cursor::unpack(head.load(Ordering::Acquire));
        let block = &self.blocks[cursor.offset as usize & (self.blocks.len() - 1)];
        (cursor, block)
    }

    fn next_block(&self, head: Cursor) -> &Block<T> {
        &self.blocks[(head.offset as usize + 1) & (self.blocks.len() - 1)]
    }

    fn allocate_entry(&self, block: &Block<T>) -> Option<u32> {
        if Cursor::unpack(block.allocated.load(Ordering::Acquire)).offset >= B as u32 {
            return None;
        }
        let allocated = Cursor::unpack(block.allocated.fetch_add(1, Ordering::AcqRel));
        (allocated.offset < B as u32).then_some(allocated.offset)
    }

    fn reserve_entry(&self, block: &Block<T>, backoff: &mut Backoff) -> Reserve {
        loop {
            let reserved = Cursor::unpack(block.reserved.load(Ordering::Acquire));
            if reserved.offset >= B as u32 {
                return Reserve::BlockDone;
            }

            let committed = Cursor::unpack(block.committed.load(Ordering::Acquire));
            if committed.offset == reserved.offset {
                return Reserve::Fail;
            }
            if committed.offset != B as u32 {
                // Entries allocated but not yet committed: the reservation
                // would overtake an in-flight write.
                let allocated = Cursor::unpack(block.allocated.load(Ordering::Acquire));
                if committed.offset != allocated.offset {
                    return Reserve::Busy;
                }
            }

            let proposed = Cursor::new(reserved.offset + 1, reserved.version);
            if fetch_max(&block.reserved, proposed.pack()) == reserved.pack() {
                return Reserve::Success {
                    offset: reserved.offset,
                };
            }
            backoff.spin();
        }
    }

    fn advance_phead(&self, head: Cursor) -> Advance {
        let next = self.next_block(head);

        let consumed = Cursor::unpack(next.consumed.load(Ordering::Acquire));
        if consumed.version < head.version
            || (consumed.version == head.version && consumed.offset != B as u32)
        {
            // The next block still holds entries from the previous lap.
            let reserved = Cursor::unpack(next.reserved.load(Ordering::Acquire));
            if reserved.offset == consumed.offset {
                return Advance::Fail;
            }
            return Advance::Busy;
        }

        let opened = Cursor::new(0, head.version.wrapping_add(1));
        fetch_max(&next.committed, opened.pack());
        fetch_max(&next.allocated, opened.pack());

        fetch_max(&self.phead, self.bumped_head(head).pack());
        Advance::Advanced
    }

    fn advance_chead(&self, head: Cursor) -> bool {
        let next = self.next_block(head);

        let committed = Cursor::unpack(next.committed.load(Ordering::Acquire));
        if committed.version != head.version.wrapping_add(1) {
            return false;
        }

        let opened = Cursor::new(0, head.version.wrapping_add(1));
        fetch_max(&next.consumed, opened.pack());
        fetch_max(&next.reserved, opened.pack());

        fetch_max(&self.chead, self.bumped_head(head).pack());
        true
    }

    /// The head cursor for the following block; the version ticks when the
    /// block index wraps around the ring.
    fn bumped_head(&self, head: Cursor) -> Cursor {
        let offset = head.offset.wrapping_add(1);
        let version = if offset as usize & (self.blocks.len() - 1) == 0 {
            head.version.wrapping_add(1)
        } else {
            head.version
        };
        Cursor::new(offset, version)
    }
}

impl<T, const N: usize, const B: usize> Drop for Bbq<T, N, B> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Monotone raise: CAS-loop `fetch_max` over the packed `(version, offset)`
/// image, whose integer order is the cursor order. Returns the last value
/// observed before the raise took effect (or the winner that beat it).
fn fetch_max(cursor: &AtomicU64, value: u64) -> u64 {
    let mut current = cursor.load(Ordering::Acquire);
    loop {
        if current >= value {
            return current;
        }
        match cursor.compare_exchange_weak(current, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(previous) => return previous,
            Err(observed) => current = observed,
        }
    }
}
