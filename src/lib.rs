#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Lock-free concurrent containers with hazard-era memory reclamation.
//!
//! The crate provides a LIFO stack and a FIFO queue in bounded
//! (fixed-capacity, preallocated) and unbounded (node-based) variants:
//!
//! - [`BoundedStack`] - array stack driven by a double-width CAS on a
//!   versioned top descriptor.
//! - [`BoundedQueue`] - MPMC ring with claim/publish cursor pairs.
//! - [`Bbq`] - block-based bounded queue; a plain `fetch_add` claims an
//!   entry on the hot path.
//! - [`UnboundedStack`] - Treiber stack.
//! - [`UnboundedBlockedStack`] - Treiber chain of sealed bounded-stack
//!   blocks, amortising reclamation over whole blocks.
//! - [`UnboundedQueue`] - Michael-Scott queue.
//!
//! The unbounded containers reclaim their nodes through
//! [`HazardEraAllocator`], which defers each free until no thread can still
//! observe the node. Per-thread state throughout the crate is indexed by the
//! dense ids of the thread registry ([`current_thread_id`], capped at
//! [`MAX_THREADS`] concurrent threads).
//!
//! Also included: per-thread [`StripedCounter`]/[`FrequencyCounter`]
//! statistics counters, and a single-threaded [`ExtendibleHashTable`] that
//! grows by splitting one page at a time.
//!
//! All concurrent operations are *try*-style: they succeed, report
//! full/empty, or retry internally with exponential backoff; none of them
//! block on a lock.

mod bbq;
mod blocked_stack;
mod bounded_queue;
mod bounded_stack;
mod common;
mod counter;
mod eht;
mod smr;
mod unbounded_queue;
mod unbounded_stack;

pub use bbq::Bbq;
pub use blocked_stack::UnboundedBlockedStack;
pub use bounded_queue::BoundedQueue;
pub use bounded_stack::BoundedStack;
pub use counter::{CounterValue, FrequencyCounter, StripedCounter};
pub use eht::{DefaultHashBuilder, ExtendibleHashTable};
pub use smr::{current_thread_id, Guard, HazardEraAllocator, MAX_THREADS};
pub use unbounded_queue::UnboundedQueue;
pub use unbounded_stack::UnboundedStack;
