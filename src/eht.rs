//! Extendible hash table (single-threaded).
//!
//! Keys live in fixed-size *pages* addressed through a *directory*: a
//! power-of-two vector of page handles indexed by the low
//! `global_depth` bits of the key's hash. Each page knows its own
//! `local_depth`, how many of those bits actually route into it. A page
//! with `local_depth < global_depth` is shared by several directory slots.
//!
//! When a page overflows it splits in two, redistributing its keys by the
//! next hash bit, and only the directory slots that pointed at it are
//! rewritten; if the page was already at `global_depth`, the directory
//! doubles first (pointer copies only, no key moves). Growth is therefore
//! local: one page of keys rehashes per overflow, never the whole table.
//!
//! Page sharing uses plain `Rc` handles: the handle count *is* the page's
//! reference count, and a page is freed the moment the last directory slot
//! stops pointing at it.

use std::{
    cell::RefCell,
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    rc::Rc,
};

/// Default hasher for [`ExtendibleHashTable`].
pub type DefaultHashBuilder = RandomState;

struct Page<K, const P: usize> {
    local_depth: u32,
    len: usize,
    slots: [Option<K>; P],
}

impl<K: Eq, const P: usize> Page<K, P> {
    fn new(local_depth: u32) -> Self {
        Self {
            local_depth,
            len: 0,
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Probe sequence: linear from the byte-swapped hash. Lookups stop at
    /// the first empty slot; with no deletions a key can never live beyond
    /// one.
    fn probe_start(hash: u64) -> usize {
        hash.swap_bytes() as usize & (P - 1)
    }

    fn contains(&self, key: &K, hash: u64) -> bool {
        let start = Self::probe_start(hash);
        for i in 0..P {
            match &self.slots[(start + i) & (P - 1)] {
                None => return false,
                Some(occupant) if occupant == key => return true,
                Some(_) => {}
            }
        }
        false
    }

    fn place(&mut self, key: K, hash: u64) -> Result<(), K> {
        let start = Self::probe_start(hash);
        for i in 0..P {
            let slot = &mut self.slots[(start + i) & (P - 1)];
            if slot.is_none() {
                *slot = Some(key);
                self.len += 1;
                return Ok(());
            }
        }
        Err(key)
    }
}

/// A hash set with extendible (linear) hashing over pages of `P` slots.
///
/// Single-threaded: mutation takes `&mut self`, and shared pages are `Rc`s.
/// `P` must be a power of two. Pages split at ¾ occupancy.
pub struct ExtendibleHashTable<K, S = DefaultHashBuilder, const P: usize = 128> {
    global_depth: u32,
    directory: Vec<Rc<RefCell<Page<K, P>>>>,
    len: usize,
    hash_builder: S,
}

impl<K: Hash + Eq, const P: usize> Default for ExtendibleHashTable<K, DefaultHashBuilder, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq, const P: usize> ExtendibleHashTable<K, DefaultHashBuilder, P> {
    pub fn new() -> Self {
        Self::with_hasher(DefaultHashBuilder::default())
    }
}

impl<K: Hash + Eq, S: BuildHasher, const P: usize> ExtendibleHashTable<K, S, P> {
    const SPLIT_THRESHOLD: usize = P * 3 / 4;

    pub fn with_hasher(hash_builder: S) -> Self {
        assert!(P.is_power_of_two(), "page size must be a power of two");
        assert!(P >= 2, "a page needs room to split");

        Self {
            global_depth: 0,
            directory: vec![Rc::new(RefCell::new(Page::new(0)))],
            len: 0,
            hash_builder,
        }
    }

    /// Inserts the key; returns `false` if it was already present.
    pub fn insert(&mut self, key: K) -> bool {
        let hash = self.hash_of(&key);
        let mut key = key;
        loop {
            let page = Rc::clone(&self.directory[self.directory_index(hash)]);
            {
                let mut page = page.borrow_mut();
                if page.contains(&key, hash) {
                    return false;
                }
                if page.len < Self::SPLIT_THRESHOLD {
                    match page.place(key, hash) {
                        Ok(()) => {
                            self.len += 1;
                            return true;
                        }
                        Err(rejected) => key = rejected,
                    }
                }
            }
            // Page at threshold (or, with heavy collisions, full below it):
            // split and route the key again.
            self.split(&page);
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let hash = self.hash_of(key);
        self.directory[self.directory_index(hash)]
            .borrow()
            .contains(key, hash)
    }

    /// Number of keys in the table.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn global_depth(&self) -> u32 {
        self.global_depth
    }

    /// Fraction of allocated page slots in use.
    pub fn occupancy(&self) -> f64 {
        self.len as f64 / (self.page_count() * P) as f64
    }

    fn hash_of(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    fn directory_index(&self, hash: u64) -> usize {
        hash as usize & ((1 << self.global_depth) - 1)
    }

    fn split(&mut self, page: &Rc<RefCell<Page<K, P>>>) {
        let local_depth = page.borrow().local_depth;
        assert!(
            local_depth < u64::BITS,
            "hash bits exhausted: more than {P} keys share one hash"
        );

        if local_depth == self.global_depth {
            self.double_directory();
        }

        let bit = 1u64 << local_depth;
        let low = Rc::new(RefCell::new(Page::new(local_depth + 1)));
        let high = Rc::new(RefCell::new(Page::new(local_depth + 1)));
        {
            let mut old = page.borrow_mut();
            let mut low = low.borrow_mut();
            let mut high = high.borrow_mut();
            for slot in old.slots.iter_mut() {
                if let Some(key) = slot.take() {
                    let hash = self.hash_of(&key);
                    let child = if hash & bit != 0 { &mut high } else { &mut low };
                    if child.place(key, hash).is_err() {
                        unreachable!("a split child cannot overflow");
                    }
                }
            }
            old.len = 0;
        }

        // Rewrite exactly the slots that still route to the split page;
        // dropping the last handle frees it.
        for (index, entry) in self.directory.iter_mut().enumerate() {
            if Rc::ptr_eq(entry, page) {
                *entry = if index as u64 & bit != 0 {
                    Rc::clone(&high)
                } else {
                    Rc::clone(&low)
                };
            }
        }
    }

    /// Doubles the directory by mirroring it: slot `i + old_len` routes to
    /// the same page as slot `i` until a later split separates them.
    fn double_directory(&mut self) {
        self.directory.extend_from_within(..);
        self.global_depth += 1;
    }

    fn page_count(&self) -> usize {
        let mut seen: Vec<*const RefCell<Page<K, P>>> = self
            .directory
            .iter()
            .map(Rc::as_ptr)
            .collect();
        seen.sort_unstable();
        seen.dedup();
        seen.len()
    }
}
