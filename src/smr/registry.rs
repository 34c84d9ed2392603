//! Dense thread identifiers.
//!
//! Per-thread state in this crate (era reservations, retire lists, counter
//! stripes) lives in fixed arrays indexed by a small integer id. The registry
//! hands out ids from `[0, MAX_THREADS)`: the first call on a thread claims
//! the lowest free slot, and the slot is released when the thread exits, so
//! ids are recycled across short-lived threads.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use once_cell::sync::Lazy;

/// Upper bound on the number of threads that may operate on the containers
/// concurrently.
pub const MAX_THREADS: usize = 128;

static REGISTRY: Lazy<ThreadRegistry> = Lazy::new(ThreadRegistry::new);

/// Monotone source of nonzero per-thread tokens. A token marks a slot as
/// claimed; zero marks it as free.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

struct ThreadRegistry {
    slots: Box<[CachePadded<AtomicU64>]>,
}

impl ThreadRegistry {
    fn new() -> Self {
        let slots = (0..MAX_THREADS)
            .map(|_| CachePadded::new(AtomicU64::new(0)))
            .collect();
        Self { slots }
    }
}

struct Registration {
    index: usize,
}

impl Registration {
    fn acquire() -> Self {
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        for (index, slot) in REGISTRY.slots.iter().enumerate() {
            if slot.load(Ordering::Relaxed) != 0 {
                continue;
            }
            if slot
                .compare_exchange(0, token, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Self { index };
            }
        }

        log::error!(
            "thread registry exhausted: more than {} threads are live at once",
            MAX_THREADS
        );
        panic!("thread registry exhausted ({MAX_THREADS} slots)");
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        // Release pairs with the acquire CAS of the next claimant, ordering
        // this thread's final accesses to id-indexed state before reuse.
        REGISTRY.slots[self.index].store(0, Ordering::Release);
    }
}

thread_local! {
    static REGISTRATION: Registration = Registration::acquire();
}

/// Returns the calling thread's dense id in `[0, MAX_THREADS)`.
///
/// The first call on a thread claims a slot; later calls are a thread-local
/// read.
pub fn current_thread_id() -> usize {
    REGISTRATION.with(|registration| registration.index)
}
