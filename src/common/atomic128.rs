use std::sync::atomic::Ordering;

use portable_atomic::AtomicU128;

/// A 16-byte atomic cell.
///
/// On x86_64 with `cmpxchg16b` (and on AArch64) the compare-exchange maps to
/// a native double-width instruction; elsewhere `portable-atomic` supplies a
/// correct fallback. Callers pack their own bit layout into the `u128` image;
/// this type only guarantees the load/store/CAS are performed on all sixteen
/// bytes at once.
#[repr(transparent)]
pub(crate) struct AtomicCell128 {
    inner: AtomicU128,
}

impl AtomicCell128 {
    pub(crate) const fn new(value: u128) -> Self {
        Self {
            inner: AtomicU128::new(value),
        }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> u128 {
        self.inner.load(order)
    }

    #[inline]
    pub(crate) fn store(&self, value: u128, order: Ordering) {
        self.inner.store(value, order);
    }

    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: u128,
        new: u128,
        success: Ordering,
        failure: Ordering,
    ) -> Result<u128, u128> {
        self.inner.compare_exchange(current, new, success, failure)
    }
}

impl Default for AtomicCell128 {
    fn default() -> Self {
        Self::new(0)
    }
}
