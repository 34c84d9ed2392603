use std::{
    mem,
    ptr,
    sync::atomic::{fence, AtomicPtr, AtomicU64, Ordering},
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::smr::registry::{current_thread_id, MAX_THREADS};

/// Every `ALLOC_ERA_FREQ`-th allocation advances the era clock.
const ALLOC_ERA_FREQ: u64 = 128;

/// Retire-list length that triggers a reclamation scan (`Rmax`).
pub(crate) const RETIRE_SCAN_THRESHOLD: usize = 64;

/// Retire stamp of a node that has not been retired yet.
const NOT_RETIRED: u64 = u64::MAX;

const _: () = assert!(ALLOC_ERA_FREQ.is_power_of_two());

/// Header-carrying allocation unit. User code holds a pointer to `value`;
/// the allocator recovers the full record by offset arithmetic, so the
/// layout must stay fixed.
#[repr(C)]
struct EraBox<T> {
    allocated: u64,
    retired: u64,
    value: T,
}

/// A thread's published protection interval. Both words zero means the
/// thread holds no guard.
#[derive(Default)]
struct Reservation {
    min_era: AtomicU64,
    max_era: AtomicU64,
}

struct ThreadData<T> {
    allocs: AtomicU64,
    retired: Mutex<Vec<*mut EraBox<T>>>,
}

impl<T> Default for ThreadData<T> {
    fn default() -> Self {
        Self {
            allocs: AtomicU64::new(0),
            retired: Mutex::new(Vec::new()),
        }
    }
}

/// Hazard-era allocator backing one node-based container.
///
/// The allocator owns the era clock, one reservation slot per possible
/// thread, and one retire list per possible thread. Nodes are allocated
/// with [`allocate`](Self::allocate), published by the container through an
/// atomic pointer, read under a [`Guard`], unlinked, and handed back with
/// [`retire`](Self::retire). Retired nodes are freed by a scan once no
/// reservation interval overlaps their lifetime.
pub struct HazardEraAllocator<T> {
    era: CachePadded<AtomicU64>,
    reservations: Box<[CachePadded<Reservation>]>,
    threads: Box<[CachePadded<ThreadData<T>>]>,
    allocated_total: CachePadded<AtomicU64>,
    retired_total: CachePadded<AtomicU64>,
    freed_total: CachePadded<AtomicU64>,
}

// The retire lists hold raw pointers to heap records that are only ever
// freed once (scan holds the list mutex) and whose values are `T`.
unsafe impl<T: Send> Send for HazardEraAllocator<T> {}
unsafe impl<T: Send> Sync for HazardEraAllocator<T> {}

impl<T> Default for HazardEraAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HazardEraAllocator<T> {
    pub fn new() -> Self {
        Self {
            era: CachePadded::new(AtomicU64::new(1)),
            reservations: (0..MAX_THREADS).map(|_| CachePadded::default()).collect(),
            threads: (0..MAX_THREADS).map(|_| CachePadded::default()).collect(),
            allocated_total: CachePadded::new(AtomicU64::new(0)),
            retired_total: CachePadded::new(AtomicU64::new(0)),
            freed_total: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// Enters a protection scope for the calling thread.
    ///
    /// While the guard is alive, no node retired at an era the guard has
    /// observed can be freed. Guards must not nest on a thread.
    pub fn guard(&self) -> Guard<'_, T> {
        let tid = current_thread_id();
        let reservation = &self.reservations[tid];
        debug_assert_eq!(
            reservation.max_era.load(Ordering::Relaxed),
            0,
            "hazard-era guards must not nest on a thread",
        );

        let era = self.era.load(Ordering::Acquire);
        reservation.min_era.store(era, Ordering::SeqCst);
        reservation.max_era.store(era, Ordering::SeqCst);
        Guard {
            allocator: self,
            tid,
        }
    }

    /// Allocates a node stamped with the current era and returns a pointer
    /// to its value. The pointer stays valid until the node is freed by a
    /// scan after [`retire`](Self::retire), or by
    /// [`deallocate_unsafe`](Self::deallocate_unsafe).
    pub fn allocate(&self, value: T) -> *mut T {
        let record = Box::new(EraBox {
            allocated: self.era.load(Ordering::Acquire),
            retired: NOT_RETIRED,
            value,
        });
        let record = Box::into_raw(record);

        let allocs = &self.threads[current_thread_id()].allocs;
        if allocs.fetch_add(1, Ordering::Relaxed) & (ALLOC_ERA_FREQ - 1) == 0 {
            self.era.fetch_add(1, Ordering::Release);
        }
        self.allocated_total.fetch_add(1, Ordering::Relaxed);

        unsafe { ptr::addr_of_mut!((*record).value) }
    }

    /// Hands an unlinked node back for deferred reclamation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator,
    /// must have been unlinked from every shared location, and must be
    /// retired at most once.
    pub unsafe fn retire(&self, ptr: *mut T) {
        let record = Self::era_box(ptr);
        debug_assert_eq!((*record).retired, NOT_RETIRED, "pointer retired twice");
        (*record).retired = self.era.load(Ordering::Relaxed);
        self.retired_total.fetch_add(1, Ordering::Relaxed);

        let mut retired = self.threads[current_thread_id()].retired.lock();
        retired.push(record);
        if retired.len() >= RETIRE_SCAN_THRESHOLD {
            self.era.fetch_add(1, Ordering::Release);
            self.scan(&mut retired);
        }
    }

    /// Frees a node immediately, bypassing reclamation.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) on this allocator
    /// and must be unreachable by every other thread: either it was never
    /// published, or the container is being destroyed.
    pub unsafe fn deallocate_unsafe(&self, ptr: *mut T) {
        self.free(Self::era_box(ptr));
    }

    /// Scans every thread's retire list, freeing what is no longer
    /// protected. Best-effort; anything still covered by a reservation
    /// stays queued.
    pub fn reclaim(&self) {
        for data in self.threads.iter() {
            self.scan(&mut data.retired.lock());
        }
    }

    fn scan(&self, retired: &mut Vec<*mut EraBox<T>>) {
        fence(Ordering::SeqCst);
        retired.retain(|&record| {
            if self.can_free(record) {
                unsafe { self.free(record) };
                false
            } else {
                true
            }
        });
    }

    /// A retired record may be freed iff no reservation interval
    /// intersects its `[allocated, retired]` lifetime.
    fn can_free(&self, record: *mut EraBox<T>) -> bool {
        let (allocated, retired) = unsafe { ((*record).allocated, (*record).retired) };
        for reservation in self.reservations.iter() {
            let min = reservation.min_era.load(Ordering::Acquire);
            let max = reservation.max_era.load(Ordering::Acquire);

            if min <= allocated && allocated <= max {
                return false;
            }
            if min <= retired && retired <= max {
                return false;
            }
            if allocated <= min && retired >= max && max != 0 {
                return false;
            }
        }
        true
    }

    unsafe fn free(&self, record: *mut EraBox<T>) {
        drop(Box::from_raw(record));
        self.freed_total.fetch_add(1, Ordering::Relaxed);
    }

    fn era_box(ptr: *mut T) -> *mut EraBox<T> {
        let offset = mem::offset_of!(EraBox<T>, value);
        ptr.cast::<u8>().wrapping_sub(offset).cast::<EraBox<T>>()
    }

    fn clear_reservation(&self, tid: usize) {
        let reservation = &self.reservations[tid];
        reservation.min_era.store(0, Ordering::Relaxed);
        reservation.max_era.store(0, Ordering::Relaxed);
    }

    pub(crate) fn retired_count(&self) -> u64 {
        self.retired_total.load(Ordering::Relaxed)
    }

    /// Allocations not yet freed, including nodes still linked into the
    /// owning container.
    pub(crate) fn outstanding(&self) -> u64 {
        self.allocated_total.load(Ordering::Relaxed) - self.freed_total.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    fn freed_count(&self) -> u64 {
        self.freed_total.load(Ordering::Relaxed)
    }
}

impl<T> Drop for HazardEraAllocator<T> {
    fn drop(&mut self) {
        // Exclusive access: no guards can be alive (they borrow `self`),
        // so every queued record is free to go.
        for data in self.threads.iter_mut() {
            for record in mem::take(&mut *data.retired.get_mut()) {
                unsafe { drop(Box::from_raw(record)) };
            }
        }
    }
}

/// Scoped protection handle returned by
/// [`HazardEraAllocator::guard`]. Dropping it withdraws the thread's
/// reservation.
pub struct Guard<'a, T> {
    allocator: &'a HazardEraAllocator<T>,
    tid: usize,
}

impl<T> Guard<'_, T> {
    /// Loads a shared pointer and publishes an era that covers it.
    ///
    /// The load is repeated until the era clock is observed unchanged
    /// across the load, which guarantees retirers see the reservation
    /// before this thread dereferences the pointer.
    pub fn protect(&self, src: &AtomicPtr<T>) -> *mut T {
        let reservation = &self.allocator.reservations[self.tid];
        let mut reserved = reservation.max_era.load(Ordering::Relaxed);
        loop {
            let value = src.load(Ordering::Acquire);
            let era = self.allocator.era.load(Ordering::Acquire);
            if era == reserved {
                return value;
            }
            reservation.max_era.store(era, Ordering::SeqCst);
            reserved = era;
        }
    }
}

impl<T> Drop for Guard<'_, T> {
    fn drop(&mut self) {
        self.allocator.clear_reservation(self.tid);
    }
}

#[cfg(test)]
mod tests {
    use super::{HazardEraAllocator, ALLOC_ERA_FREQ, RETIRE_SCAN_THRESHOLD};
    use std::sync::{
        atomic::{AtomicBool, AtomicPtr, Ordering},
        mpsc, Arc,
    };
    use std::thread;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn scan_frees_unobserved_nodes() {
        let allocator = HazardEraAllocator::new();
        for _ in 0..(RETIRE_SCAN_THRESHOLD + 1) {
            let ptr = allocator.allocate(0u64);
            unsafe { allocator.retire(ptr) };
        }
        // The threshold-crossing retire ran a scan with no reservations
        // published, so at least one batch went back to the heap.
        assert!(allocator.freed_count() >= RETIRE_SCAN_THRESHOLD as u64);
    }

    #[test]
    fn era_advances_with_allocations() {
        let allocator = HazardEraAllocator::new();
        let before = allocator.era.load(Ordering::Relaxed);
        let ptrs: Vec<_> = (0..(ALLOC_ERA_FREQ + 1))
            .map(|value| allocator.allocate(value))
            .collect();
        assert!(allocator.era.load(Ordering::Relaxed) > before);
        for ptr in ptrs {
            unsafe { allocator.deallocate_unsafe(ptr) };
        }
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn guard_blocks_reclamation_of_protected_node() {
        let allocator = Arc::new(HazardEraAllocator::new());
        let dropped = Arc::new(AtomicBool::new(false));

        let node = allocator.allocate(DropFlag(Arc::clone(&dropped)));
        let head = Arc::new(AtomicPtr::new(node));

        let (protected_tx, protected_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let reader = {
            let allocator = Arc::clone(&allocator);
            let head = Arc::clone(&head);
            thread::spawn(move || {
                let guard = allocator.guard();
                let ptr = guard.protect(&head);
                assert!(!ptr.is_null());
                protected_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                drop(guard);
            })
        };

        protected_rx.recv().unwrap();

        // Unlink and retire while the reader still holds its guard.
        head.store(std::ptr::null_mut(), Ordering::Release);
        unsafe { allocator.retire(node) };

        // Push enough garbage through to force several scans.
        for _ in 0..(RETIRE_SCAN_THRESHOLD * 2) {
            let filler = allocator.allocate(DropFlag(Arc::new(AtomicBool::new(false))));
            unsafe { allocator.retire(filler) };
        }
        assert!(
            !dropped.load(Ordering::Relaxed),
            "protected node was freed under an active guard"
        );

        release_tx.send(()).unwrap();
        reader.join().unwrap();

        allocator.reclaim();
        assert!(dropped.load(Ordering::Relaxed));
        assert_eq!(allocator.outstanding(), 0);
    }

    #[test]
    fn drop_drains_retire_lists() {
        let dropped = Arc::new(AtomicBool::new(false));
        {
            let allocator = HazardEraAllocator::new();
            let ptr = allocator.allocate(DropFlag(Arc::clone(&dropped)));
            unsafe { allocator.retire(ptr) };
            // Below the scan threshold: the record is still queued when the
            // allocator goes away.
        }
        assert!(dropped.load(Ordering::Relaxed));
    }
}
