//! Unbounded lock-free FIFO (Michael-Scott) queue.
//!
//! `head` always points at a dummy node; the logical front of the queue is
//! the dummy's successor. Enqueue links a node after `tail` and then swings
//! `tail` forward best-effort; any thread that finds `tail` lagging helps it
//! along, so `tail` is never more than one link behind. Dequeue swings
//! `head` to the front node, which becomes the new dummy; the old dummy is
//! retired through hazard eras.

use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    ptr,
    sync::atomic::{fence, AtomicPtr, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::common::backoff::Backoff;
use crate::smr::hazard_era::HazardEraAllocator;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    /// Empty in the dummy; initialized in every enqueued node; moved out by
    /// the dequeue that turns the node into the new dummy. Never dropped
    /// with the node itself.
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Node<T> {
    fn dummy() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn with_value(value: T) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value: UnsafeCell::new(MaybeUninit::new(value)),
        }
    }
}

/// A lock-free FIFO queue of heap nodes reclaimed through hazard eras.
pub struct UnboundedQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    smr: HazardEraAllocator<Node<T>>,
}

unsafe impl<T: Send> Send for UnboundedQueue<T> {}
unsafe impl<T: Send> Sync for UnboundedQueue<T> {}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> UnboundedQueue<T> {
    pub fn new() -> Self {
        let smr = HazardEraAllocator::new();
        let dummy = smr.allocate(Node::dummy());
        Self {
            head: CachePadded::new(AtomicPtr::new(dummy)),
            tail: CachePadded::new(AtomicPtr::new(dummy)),
            smr,
        }
    }

    pub fn push(&self, value: T) {
        let guard = self.smr.guard();
        let node = self.smr.allocate(Node::with_value(value));
        let mut backoff = Backoff::new();
        loop {
            let tail = guard.protect(&self.tail);
            let next = guard.protect(unsafe { &(*tail).next });
            if tail != self.tail.load(Ordering::Relaxed) {
                backoff.spin();
                continue;
            }

            if next.is_null() {
                if unsafe { &(*tail).next }
                    .compare_exchange_weak(next, node, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    // Best effort; a lagging tail is helped forward by
                    // whoever notices it.
                    let _ = self.tail.compare_exchange_weak(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    return;
                }
            } else {
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            }

            backoff.spin();
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = self.smr.guard();
        let mut backoff = Backoff::new();
        loop {
            let head = guard.protect(&self.head);
            let next = guard.protect(unsafe { &(*head).next });
            let tail = self.tail.load(Ordering::Relaxed);
            if head != self.head.load(Ordering::Relaxed) {
                backoff.spin();
                continue;
            }

            if head == tail {
                if next.is_null() {
                    return None;
                }
                // Tail is lagging behind an in-flight push; help it.
                let _ = self.tail.compare_exchange_weak(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                );
            } else if self
                .head
                .compare_exchange_weak(head, next, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                fence(Ordering::Acquire);
                // `next` is the new dummy and this thread won it: nobody
                // else will read its value slot again.
                let value = unsafe { (*(*next).value.get()).assume_init_read() };
                unsafe { self.smr.retire(head) };
                return Some(value);
            }

            backoff.spin();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed) == self.tail.load(Ordering::Relaxed)
    }

    /// Removes every element, dropping the values in place. The queue keeps
    /// a fresh dummy node and stays usable.
    pub fn clear(&mut self) {
        unsafe { self.free_list() };
        let dummy = self.smr.allocate(Node::dummy());
        *self.head.get_mut() = dummy;
        *self.tail.get_mut() = dummy;
    }

    /// # Safety
    ///
    /// Requires `&mut self` exclusivity; leaves `head`/`tail` dangling.
    unsafe fn free_list(&mut self) {
        // The first node is the dummy: its value slot is already dead.
        let dummy = *self.head.get_mut();
        let mut node = (*dummy).next.load(Ordering::Relaxed);
        self.smr.deallocate_unsafe(dummy);
        while !node.is_null() {
            let next = (*node).next.load(Ordering::Relaxed);
            ptr::drop_in_place((*node).value.get().cast::<T>());
            self.smr.deallocate_unsafe(node);
            node = next;
        }
    }
}

impl<T> Drop for UnboundedQueue<T> {
    fn drop(&mut self) {
        unsafe { self.free_list() };
    }
}

#[cfg(test)]
mod tests {
    use super::UnboundedQueue;
    use crate::smr::hazard_era::RETIRE_SCAN_THRESHOLD;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn fifo_order_and_clear() {
        let mut queue = UnboundedQueue::new();
        assert!(queue.is_empty());

        queue.push("a");
        queue.push("b");
        queue.push("c");
        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);

        queue.push("d");
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);

        queue.push("e");
        assert_eq!(queue.pop(), Some("e"));
    }

    #[test]
    fn long_run_keeps_fifo_order_through_reclamation() {
        let queue = UnboundedQueue::new();
        // Far past the scan threshold, so retired dummies get recycled
        // while the queue is in active use.
        for value in 0..(RETIRE_SCAN_THRESHOLD * 64) {
            queue.push(value);
            assert_eq!(queue.pop(), Some(value));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn values_drop_exactly_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = UnboundedQueue::new();
            for _ in 0..10 {
                queue.push(Tracked(Arc::clone(&drops)));
            }
            for _ in 0..4 {
                drop(queue.pop());
            }
            assert_eq!(drops.load(Ordering::Relaxed), 4);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn concurrent_use_bounds_deferred_memory() {
        const THREADS: usize = 8;
        const PAIRS: usize = 20_000;

        let queue: Arc<UnboundedQueue<usize>> = Arc::new(UnboundedQueue::new());
        let popped = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || {
                let mut local = Vec::new();
                for i in 0..PAIRS {
                    queue.push(t * PAIRS + i);
                    if let Some(value) = queue.pop() {
                        local.push(value);
                    }
                }
                popped.lock().unwrap().extend(local);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = popped.lock().unwrap().clone();
        while let Some(value) = queue.pop() {
            assert!(seen.insert(value), "value {value} surfaced twice");
        }
        assert_eq!(seen.len(), THREADS * PAIRS);

        // Deferred records are bounded by threads × scan threshold, plus
        // the live dummy (and slack for the last unscanned stragglers).
        assert!(queue.smr.outstanding() <= (THREADS * RETIRE_SCAN_THRESHOLD) as u64 + 2);

        queue.smr.reclaim();
        assert_eq!(queue.smr.outstanding(), 1, "only the dummy should remain");
    }
}
