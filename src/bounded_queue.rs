//! Fixed-capacity MPMC ring queue.
//!
//! Four monotone cursors split each side of the queue into a *head* that
//! claims a slot and a *tail* that publishes it. A producer CASes `phead`
//! forward to claim a slot, writes it, then waits for every earlier producer
//! to publish before bumping `ptail`; consumers mirror the protocol with
//! `chead`/`ctail`. The publish spin is the only wait in the algorithm and
//! is bounded by the predecessor's slot write.

use std::{
    cell::UnsafeCell,
    hint,
    mem::MaybeUninit,
    sync::atomic::{AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::common::backoff::Backoff;

/// A lock-free bounded queue of `N` preallocated slots; `N` must be a power
/// of two. `push` hands the value back when the queue is full; `pop` returns
/// `None` when it is empty.
pub struct BoundedQueue<T, const N: usize> {
    phead: CachePadded<AtomicUsize>,
    ptail: CachePadded<AtomicUsize>,
    chead: CachePadded<AtomicUsize>,
    ctail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send, const N: usize> Send for BoundedQueue<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for BoundedQueue<T, N> {}

impl<T, const N: usize> Default for BoundedQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const N: usize> BoundedQueue<T, N> {
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "capacity must be a power of two");

        Self {
            phead: CachePadded::new(AtomicUsize::new(0)),
            ptail: CachePadded::new(AtomicUsize::new(0)),
            chead: CachePadded::new(AtomicUsize::new(0)),
            ctail: CachePadded::new(AtomicUsize::new(0)),
            slots: (0..N).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
        }
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        let mut backoff = Backoff::new();
        loop {
            let ph = self.phead.load(Ordering::Acquire);
            let pn = ph + 1;
            if pn > self.ctail.load(Ordering::Acquire) + N {
                return Err(value);
            }
            if self
                .phead
                .compare_exchange(ph, pn, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            // The claim is ours; the slot was drained by the consumer lap
            // that `ctail` accounts for.
            unsafe { (*self.slots[pn & (N - 1)].get()).write(value) };

            // Publish in claim order: wait for the predecessor's publish.
            while self.ptail.load(Ordering::Acquire) != ph {
                hint::spin_loop();
            }
            self.ptail.store(pn, Ordering::Release);
            return Ok(());
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            let ch = self.chead.load(Ordering::Acquire);
            let cn = ch + 1;
            if cn > self.ptail.load(Ordering::Acquire) {
                return None;
            }
            if self
                .chead
                .compare_exchange(ch, cn, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            let value = unsafe { (*self.slots[cn & (N - 1)].get()).assume_init_read() };

            while self.ctail.load(Ordering::Acquire) != ch {
                hint::spin_loop();
            }
            self.ctail.store(cn, Ordering::Release);
            return Some(value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chead.load(Ordering::Acquire) == self.ptail.load(Ordering::Acquire)
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Drop for BoundedQueue<T, N> {
    fn drop(&mut self) {
        // Exclusive access: the unconsumed range is exactly
        // (ctail, ptail]; everything else is vacant.
        let published = *self.ptail.get_mut();
        let consumed = *self.ctail.get_mut();
        for i in (consumed + 1)..=published {
            unsafe { (*self.slots[i & (N - 1)].get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BoundedQueue;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[test]
    fn fifo_order_and_capacity() {
        let queue: BoundedQueue<u32, 4> = BoundedQueue::new();
        assert!(queue.is_empty());

        for value in 1..=4 {
            assert!(queue.push(value).is_ok());
        }
        assert_eq!(queue.push(5), Err(5));

        for value in 1..=4 {
            assert_eq!(queue.pop(), Some(value));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn cursors_wrap_the_ring() {
        let queue: BoundedQueue<usize, 8> = BoundedQueue::new();
        // Push/pop far beyond the capacity so every cursor laps the ring
        // many times.
        for value in 0..1000 {
            assert!(queue.push(value).is_ok());
            assert_eq!(queue.pop(), Some(value));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_releases_unconsumed_values() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue: BoundedQueue<Tracked, 4> = BoundedQueue::new();
            for _ in 0..3 {
                assert!(queue.push(Tracked(Arc::clone(&drops))).is_ok());
            }
            drop(queue.pop());
            assert_eq!(drops.load(Ordering::Relaxed), 1);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 3);
    }
}
