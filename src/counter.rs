//! Per-thread striped counters.
//!
//! Both counters spread their state over one cache line per thread, indexed
//! by the registry id, so concurrent `add` calls never contend.
//! [`StripedCounter`] is exact; [`FrequencyCounter`] trades accuracy for an
//! unsynchronised hot path, publishing its thread-local total only every
//! `PUBLISH_FREQ`-th add.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::smr::registry::{current_thread_id, MAX_THREADS};

const PUBLISH_FREQ: u64 = 256;

const _: () = assert!(PUBLISH_FREQ.is_power_of_two());

mod sealed {
    pub trait Sealed {}
    impl Sealed for u64 {}
    impl Sealed for i64 {}
    impl Sealed for usize {}
}

/// Integer types the counters can hold. Sealed: the stripes need a matching
/// atomic representation.
pub trait CounterValue: Copy + Default + sealed::Sealed {
    #[doc(hidden)]
    type Atomic: Default + Send + Sync;

    #[doc(hidden)]
    fn fetch_add_relaxed(stripe: &Self::Atomic, value: Self) -> Self;
    #[doc(hidden)]
    fn load_relaxed(stripe: &Self::Atomic) -> Self;
    #[doc(hidden)]
    fn store_relaxed(stripe: &Self::Atomic, value: Self);
    #[doc(hidden)]
    fn wrapping_add(self, other: Self) -> Self;
}

macro_rules! impl_counter_value {
    ($int:ty, $atomic:ty) => {
        impl CounterValue for $int {
            type Atomic = $atomic;

            fn fetch_add_relaxed(stripe: &Self::Atomic, value: Self) -> Self {
                stripe.fetch_add(value, Ordering::Relaxed)
            }

            fn load_relaxed(stripe: &Self::Atomic) -> Self {
                stripe.load(Ordering::Relaxed)
            }

            fn store_relaxed(stripe: &Self::Atomic, value: Self) {
                stripe.store(value, Ordering::Relaxed)
            }

            fn wrapping_add(self, other: Self) -> Self {
                <$int>::wrapping_add(self, other)
            }
        }
    };
}

impl_counter_value!(u64, AtomicU64);
impl_counter_value!(i64, AtomicI64);
impl_counter_value!(usize, AtomicUsize);

/// An exact counter striped across threads. `add` is one relaxed
/// `fetch_add` on the calling thread's own cache line; `sum` folds every
/// stripe.
pub struct StripedCounter<T: CounterValue> {
    stripes: Box<[CachePadded<T::Atomic>]>,
}

impl<T: CounterValue> Default for StripedCounter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CounterValue> StripedCounter<T> {
    pub fn new() -> Self {
        Self {
            stripes: (0..MAX_THREADS).map(|_| CachePadded::default()).collect(),
        }
    }

    pub fn add(&self, value: T) {
        T::fetch_add_relaxed(&self.stripes[current_thread_id()], value);
    }

    /// The sum of all stripes. Exact once every writer is quiescent.
    pub fn sum(&self) -> T {
        self.stripes
            .iter()
            .fold(T::default(), |acc, stripe| acc.wrapping_add(T::load_relaxed(stripe)))
    }
}

struct FrequencyStripe<T: CounterValue> {
    ops: Cell<u64>,
    local: Cell<T>,
    published: T::Atomic,
}

impl<T: CounterValue> Default for FrequencyStripe<T> {
    fn default() -> Self {
        Self {
            ops: Cell::new(0),
            local: Cell::new(T::default()),
            published: T::Atomic::default(),
        }
    }
}

/// An approximate counter with an unsynchronised `add` path.
///
/// Each stripe keeps a plain thread-local running total and pushes it into
/// its atomic only every `PUBLISH_FREQ`-th add, so `sum` lags each thread by
/// at most `PUBLISH_FREQ − 1` uncommitted adds.
pub struct FrequencyCounter<T: CounterValue> {
    stripes: Box<[CachePadded<FrequencyStripe<T>>]>,
}

// `ops` and `local` of stripe `i` are touched only by the thread whose
// registry id is `i`; `published` is atomic.
unsafe impl<T: CounterValue> Sync for FrequencyCounter<T> {}
unsafe impl<T: CounterValue> Send for FrequencyCounter<T> {}

impl<T: CounterValue> Default for FrequencyCounter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: CounterValue> FrequencyCounter<T> {
    pub fn new() -> Self {
        Self {
            stripes: (0..MAX_THREADS).map(|_| CachePadded::default()).collect(),
        }
    }

    pub fn add(&self, value: T) {
        let stripe = &self.stripes[current_thread_id()];
        let local = stripe.local.get().wrapping_add(value);
        stripe.local.set(local);
        if stripe.ops.get() & (PUBLISH_FREQ - 1) == 0 {
            T::store_relaxed(&stripe.published, local);
        }
        stripe.ops.set(stripe.ops.get() + 1);
    }

    /// The sum of all published stripe totals.
    pub fn sum(&self) -> T {
        self.stripes.iter().fold(T::default(), |acc, stripe| {
            acc.wrapping_add(T::load_relaxed(&stripe.published))
        })
    }
}
