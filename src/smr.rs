//! Safe memory reclamation for the node-based containers.
//!
//! The unbounded containers in this crate publish heap nodes through atomic
//! pointers. A node that has been unlinked cannot be freed right away: another
//! thread may have loaded the pointer just before the unlink and may still be
//! dereferencing it. The types in this module defer the free until no thread
//! can possibly hold such a reference.
//!
//! The scheme implemented here is *hazard eras*. A global era clock ticks
//! forward as nodes are allocated and retired. Every node records the era it
//! was allocated in and the era it was retired in. A thread that wants to
//! dereference shared pointers first enters a [`Guard`] scope and publishes
//! the current era in its reservation slot; the reservation is refreshed on
//! every protected load and cleared when the guard is dropped. A retired node
//! may be freed once no thread's published reservation interval intersects
//! the node's `[allocated, retired]` interval: any reader that could have
//! observed the node must have published an era from inside that window.
//!
//! Compared to classic hazard pointers, a reservation covers arbitrarily many
//! pointers at once, so the read side is a pair of plain stores instead of one
//! slot write per pointer. Compared to epoch schemes, a stalled reader only
//! pins nodes whose lifetime intersects its reservation, not every retired
//! node in the process.
//!
//! Reservations are indexed by the dense thread ids handed out by
//! [`registry`]; retired pointers accumulate in per-thread lists and are
//! scanned when a list crosses a threshold, which bounds deferred memory at
//! `O(MAX_THREADS · RETIRE_SCAN_THRESHOLD)` records per allocator.

pub(crate) mod hazard_era;
pub(crate) mod registry;

pub use hazard_era::{Guard, HazardEraAllocator};
pub use registry::{current_thread_id, MAX_THREADS};
