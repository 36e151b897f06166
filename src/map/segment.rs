//! One stripe of the concurrent map.
//!
//! A segment composes a reader-writer lock around an open-bucket hash table
//! and the segment's LRU list. Chain entries are immutable `(key, hash,
//! next)` triples behind `Arc`; only the value cell mutates. Removal rebuilds
//! the chain prefix onto the removed entry's successor so the suffix stays
//! shared, and rehash reuses the maximal trailing run whose new index
//! agrees; both keep already-traversing readers on a consistent chain.
//!
//! The segment's write lock is the serialization point for index mutation
//! and memory release: a displaced or removed value is released while the
//! lock is still held.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard};

use super::lru::Lru;
use super::value::CacheValue;

/// Bucket counts stay indexable by `u32` hashes.
const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Immutable chain node; `value` is the only mutable cell and is swapped
/// under the segment's write lock.
pub(crate) struct HashEntry<K> {
    pub(crate) key: K,
    pub(crate) hash: u32,
    pub(crate) next: Option<Arc<HashEntry<K>>>,
    value: Mutex<Arc<CacheValue<K>>>,
}

impl<K> HashEntry<K> {
    fn new(key: K, hash: u32, next: Option<Arc<HashEntry<K>>>, value: Arc<CacheValue<K>>) -> Self {
        Self {
            key,
            hash,
            next,
            value: Mutex::new(value),
        }
    }

    pub(crate) fn value(&self) -> Arc<CacheValue<K>> {
        Arc::clone(&self.value.lock())
    }
}

pub(crate) struct SegmentCore<K> {
    table: Vec<Option<Arc<HashEntry<K>>>>,
    threshold: usize,
    pub(crate) lru: Lru<K>,
}

/// Hash table stripe: rw-lock, bucket array, mod counter, LRU.
pub(crate) struct Segment<K> {
    core: RwLock<SegmentCore<K>>,
    /// Live entry count, readable without the lock for `quick_size`.
    count: AtomicUsize,
    /// Bumped on every structural change (insert/remove/clear), read by the
    /// map's size-stability protocol.
    mod_count: AtomicU64,
    load_factor: f64,
}

impl<K: std::hash::Hash + Eq + Clone> Segment<K> {
    pub(crate) fn new(initial_capacity: usize, load_factor: f64) -> Self {
        let capacity = initial_capacity.next_power_of_two().min(MAXIMUM_CAPACITY);
        Self {
            core: RwLock::new(SegmentCore {
                table: (0..capacity).map(|_| None).collect(),
                threshold: (capacity as f64 * load_factor) as usize,
                lru: Lru::new(),
            }),
            count: AtomicUsize::new(0),
            mod_count: AtomicU64::new(0),
            load_factor,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub(crate) fn mod_count(&self) -> u64 {
        self.mod_count.load(Ordering::Acquire)
    }

    pub(crate) fn lock_shared(&self) -> RwLockReadGuard<'_, SegmentCore<K>> {
        self.core.read()
    }

    /// Read-path lookup. The returned value has been retained on behalf of
    /// the caller and promoted in the LRU.
    pub(crate) fn get(&self, key: &K, hash: u32) -> Option<Arc<CacheValue<K>>> {
        let core = self.core.read();
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }

        let mut entry = core.table[hash as usize & (core.table.len() - 1)].clone();
        while let Some(e) = entry {
            if e.hash == hash && e.key == *key {
                let value = e.value();
                value.retain();
                value.touch();
                core.lru.promote(&value);
                return Some(value);
            }
            entry = e.next.clone();
        }
        None
    }

    pub(crate) fn contains_key(&self, key: &K, hash: u32) -> bool {
        let core = self.core.read();
        if self.count.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut entry = core.table[hash as usize & (core.table.len() - 1)].clone();
        while let Some(e) = entry {
            if e.hash == hash && e.key == *key {
                return true;
            }
            entry = e.next.clone();
        }
        false
    }

    /// Insert or replace. Returns `true` when the key was already present.
    ///
    /// On replace the displaced value leaves the LRU and is released while
    /// the write lock is held. With `only_if_absent` the incoming value is
    /// the one released instead.
    pub(crate) fn put(
        &self,
        key: K,
        hash: u32,
        value: Arc<CacheValue<K>>,
        only_if_absent: bool,
    ) -> bool {
        let mut core = self.core.write();

        let c = self.count.load(Ordering::Relaxed) + 1;
        if c > core.threshold {
            self.rehash(&mut core);
        }

        let index = hash as usize & (core.table.len() - 1);
        let first = core.table[index].clone();

        let mut cursor = first.clone();
        while let Some(e) = cursor {
            if e.hash == hash && e.key == key {
                if only_if_absent {
                    value.release();
                } else {
                    let old = {
                        let mut cell = e.value.lock();
                        std::mem::replace(&mut *cell, Arc::clone(&value))
                    };
                    core.lru.remove(&old);
                    core.lru.insert(&value);
                    old.release();
                }
                return true;
            }
            cursor = e.next.clone();
        }

        core.lru.insert(&value);
        core.table[index] = Some(Arc::new(HashEntry::new(key, hash, first, value)));
        self.mod_count.fetch_add(1, Ordering::Release);
        self.count.store(c, Ordering::Release);
        false
    }

    /// Remove by key. The chain prefix before the removed entry is cloned
    /// onto its successor; the suffix is shared untouched.
    pub(crate) fn remove(&self, key: &K, hash: u32) -> bool {
        let mut core = self.core.write();

        let index = hash as usize & (core.table.len() - 1);
        let first = core.table[index].clone();

        let mut target = None;
        let mut cursor = first.clone();
        while let Some(e) = cursor {
            if e.hash == hash && e.key == *key {
                target = Some(e);
                break;
            }
            cursor = e.next.clone();
        }
        let Some(target) = target else {
            return false;
        };

        let mut new_first = target.next.clone();
        let mut p = first.expect("target found in a non-empty chain");
        while !Arc::ptr_eq(&p, &target) {
            new_first = Some(Arc::new(HashEntry::new(
                p.key.clone(),
                p.hash,
                new_first,
                p.value(),
            )));
            p = p.next.clone().expect("prefix ends at target");
        }

        core.table[index] = new_first;

        self.mod_count.fetch_add(1, Ordering::Release);
        self.count
            .store(self.count.load(Ordering::Relaxed) - 1, Ordering::Release);

        let old = target.value();
        core.lru.remove(&old);
        old.release();
        true
    }

    /// Release every entry and empty the table.
    pub(crate) fn clear(&self) {
        let mut core = self.core.write();
        if self.count.load(Ordering::Relaxed) == 0 {
            return;
        }

        for bucket in core.table.iter_mut() {
            let mut entry = bucket.take();
            while let Some(e) = entry {
                e.value().release();
                entry = e.next.clone();
            }
        }
        core.lru.clear();
        self.mod_count.fetch_add(1, Ordering::Release);
        self.count.store(0, Ordering::Release);
    }

    /// Double the table. For each old bucket the maximal trailing run whose
    /// new index agrees is reused as-is; preceding entries are cloned onto
    /// their new heads.
    fn rehash(&self, core: &mut SegmentCore<K>) {
        let old_capacity = core.table.len();
        if old_capacity >= MAXIMUM_CAPACITY {
            return;
        }
        let new_capacity = old_capacity << 1;
        let mask = (new_capacity - 1) as u32;

        let old_table = std::mem::replace(
            &mut core.table,
            (0..new_capacity).map(|_| None).collect(),
        );
        core.threshold = (new_capacity as f64 * self.load_factor) as usize;

        for head in old_table {
            let Some(e) = head else { continue };

            match &e.next {
                None => {
                    let idx = (e.hash & mask) as usize;
                    core.table[idx] = Some(e);
                }
                Some(_) => {
                    // Find the last run: the longest tail mapping to one index.
                    let mut last_run = Arc::clone(&e);
                    let mut last_idx = (e.hash & mask) as usize;
                    let mut cursor = e.next.clone();
                    while let Some(n) = cursor {
                        let idx = (n.hash & mask) as usize;
                        if idx != last_idx {
                            last_idx = idx;
                            last_run = Arc::clone(&n);
                        }
                        cursor = n.next.clone();
                    }
                    core.table[last_idx] = Some(Arc::clone(&last_run));

                    // Clone everything before the run onto its new bucket.
                    let mut p = e;
                    while !Arc::ptr_eq(&p, &last_run) {
                        let idx = (p.hash & mask) as usize;
                        let next = core.table[idx].take();
                        core.table[idx] = Some(Arc::new(HashEntry::new(
                            p.key.clone(),
                            p.hash,
                            next,
                            p.value(),
                        )));
                        p = p.next.clone().expect("prefix ends at last run");
                    }
                }
            }
        }
    }

    /// Clone out every key, coldest segment order unspecified.
    pub(crate) fn keys_into(&self, out: &mut Vec<K>) {
        let core = self.core.read();
        for bucket in core.table.iter() {
            let mut entry = bucket.clone();
            while let Some(e) = entry {
                out.push(e.key.clone());
                entry = e.next.clone();
            }
        }
    }

    /// The `n` coldest entries of this segment's LRU.
    pub(crate) fn tails(&self, n: usize) -> Vec<Arc<CacheValue<K>>> {
        let core = self.core.read();
        core.lru.tails(n)
    }

    #[cfg(test)]
    pub(crate) fn table_capacity(&self) -> usize {
        self.core.read().table.len()
    }

    #[cfg(test)]
    pub(crate) fn walk_count(&self) -> usize {
        let core = self.core.read();
        let mut n = 0;
        for bucket in core.table.iter() {
            let mut entry = bucket.clone();
            while let Some(e) = entry {
                n += 1;
                entry = e.next.clone();
            }
        }
        n
    }

    #[cfg(test)]
    pub(crate) fn lru_len(&self) -> usize {
        self.core.read().lru.len()
    }
}
