//! Unbounded LIFO built from bounded-stack blocks.
//!
//! A Treiber-style list where each node carries a whole
//! [`BoundedStack`](crate::BoundedStack) of `B` values instead of a single
//! element. Push and pop work on the head block; the outer list is touched
//! only when a block fills up or drains, so the reclamation machinery sees
//! one retire per `B` operations instead of one per pop.
//!
//! A drained block is first *sealed* (its inner stack permanently rejects
//! operations) and then unlinked. Sealing closes the race where a concurrent
//! push lands in a block that is about to be unlinked: once the seal CAS
//! succeeds, the block can never accept values again, and whoever observes a
//! sealed head helps to unlink it.

use std::{
    ptr,
    sync::atomic::{fence, AtomicPtr, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::bounded_stack::BoundedStack;
use crate::smr::hazard_era::HazardEraAllocator;

struct Node<T, const B: usize> {
    /// Points towards older blocks; immutable after publication.
    next: *mut Node<T, B>,
    stack: BoundedStack<T, B>,
}

/// An unbounded lock-free stack that amortises reclamation over blocks of
/// `B` values. `T` carries the same bounds as [`BoundedStack`].
pub struct UnboundedBlockedStack<T: Copy, const B: usize = 128> {
    head: CachePadded<AtomicPtr<Node<T, B>>>,
    smr: HazardEraAllocator<Node<T, B>>,
}

unsafe impl<T: Copy + Send, const B: usize> Send for UnboundedBlockedStack<T, B> {}
unsafe impl<T: Copy + Send, const B: usize> Sync for UnboundedBlockedStack<T, B> {}

impl<T: Copy, const B: usize> Default for UnboundedBlockedStack<T, B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy, const B: usize> UnboundedBlockedStack<T, B> {
    pub fn new() -> Self {
        let smr = HazardEraAllocator::new();
        let head = smr.allocate(Node {
            next: ptr::null_mut(),
            stack: BoundedStack::new(),
        });
        Self {
            head: CachePadded::new(AtomicPtr::new(head)),
            smr,
        }
    }

    pub fn push(&self, value: T) {
        let guard = self.smr.guard();
        loop {
            // The list always holds at least one block.
            let head = guard.protect(&self.head);
            let sealed = unsafe { (*head).stack.is_sealed() };
            if unsafe { (*head).stack.push(value) } {
                return;
            }

            if sealed {
                // Drained block awaiting unlink; help remove it. A sealed
                // block always has a successor.
                let next = unsafe { (*head).next };
                if self
                    .head
                    .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    fence(Ordering::Acquire);
                    unsafe { self.smr.retire(head) };
                }
            } else {
                // Block is full: link a fresh head in front of it.
                let node = self.smr.allocate(Node {
                    next: head,
                    stack: BoundedStack::new(),
                });
                if self
                    .head
                    .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed)
                    .is_err()
                {
                    unsafe { self.smr.deallocate_unsafe(node) };
                }
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let guard = self.smr.guard();
        loop {
            let head = guard.protect(&self.head);
            if let Some(value) = unsafe { (*head).stack.pop() } {
                return Some(value);
            }

            let next = unsafe { (*head).next };
            if next.is_null() {
                return None;
            }

            if unsafe { (*head).stack.seal() }
                && self
                    .head
                    .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
            {
                fence(Ordering::Acquire);
                unsafe { self.smr.retire(head) };
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.smr.guard();
        let head = guard.protect(&self.head);
        unsafe { (*head).stack.is_empty() && (*head).next.is_null() }
    }

    /// Removes every element. Blocks are freed eagerly; the stack keeps one
    /// empty block, ready for use.
    pub fn clear(&mut self) {
        unsafe { self.free_blocks() };
        let head = self.smr.allocate(Node {
            next: ptr::null_mut(),
            stack: BoundedStack::new(),
        });
        *self.head.get_mut() = head;
    }

    /// # Safety
    ///
    /// Requires `&mut self` exclusivity; leaves `head` dangling.
    unsafe fn free_blocks(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            let next = (*node).next;
            self.smr.deallocate_unsafe(node);
            node = next;
        }
    }

    #[cfg(test)]
    fn retired_blocks(&self) -> u64 {
        self.smr.retired_count()
    }
}

impl<T: Copy, const B: usize> Drop for UnboundedBlockedStack<T, B> {
    fn drop(&mut self) {
        unsafe { self.free_blocks() };
    }
}
