//! Segmented, striped concurrent map over reference-counted values.
//!
//! Operations splay across segments by a spread of the key's hash: the upper
//! bits pick the segment, the lower bits pick the bucket, and the spread
//! decorrelates both from the key's native hash. Writes are linearizable per
//! segment; there is no global linearization point. `size` uses the
//! mod-count stability protocol: sample all segment counters twice, accept
//! when no writer interleaved, fall back to locking every segment read lock
//! in order.

mod lru;
mod segment;
mod value;

pub use value::{CacheValue, ValueRef};

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use crate::config::MAX_SEGMENTS;
use crate::error::ConfigError;

use segment::Segment;

/// Unsynchronized size attempts before falling back to locking.
const RETRIES_BEFORE_LOCK: usize = 2;

/// Striped hash map holding the cache's live values.
pub struct ConcurrentMap<K> {
    segments: Box<[Segment<K>]>,
    segment_shift: u32,
    segment_mask: u32,
    hasher: RandomState,
}

impl<K: Hash + Eq + Clone> ConcurrentMap<K> {
    /// `initial_capacity` buckets in total, split across the smallest power
    /// of two >= `concurrency` segments (capped at 65536).
    pub fn new(
        initial_capacity: usize,
        load_factor: f64,
        concurrency: usize,
    ) -> Result<Self, ConfigError> {
        if !(load_factor > 0.0) {
            return Err(ConfigError::InvalidLoadFactor(format!(
                "load_factor must be positive, got {load_factor}"
            )));
        }
        if concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency(
                "concurrency must be > 0".to_string(),
            ));
        }
        if initial_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(
                "initial_capacity must be > 0".to_string(),
            ));
        }

        let concurrency = concurrency.min(MAX_SEGMENTS);
        let mut sshift = 0;
        let mut ssize = 1;
        while ssize < concurrency {
            sshift += 1;
            ssize <<= 1;
        }

        let per_segment = initial_capacity.div_ceil(ssize);
        let segments = (0..ssize)
            .map(|_| Segment::new(per_segment, load_factor))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            segments,
            segment_shift: 32 - sshift,
            segment_mask: (ssize - 1) as u32,
            hasher: RandomState::new(),
        })
    }

    /// Spread bits of the key's native hash so both the segment selector
    /// (upper bits) and bucket selector (lower bits) decorrelate. Variant of
    /// the single-word Wang/Jenkins hash.
    fn hash(&self, key: &K) -> u32 {
        let h64 = self.hasher.hash_one(key);
        let mut h = (h64 ^ (h64 >> 32)) as u32;
        h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
        h ^= h >> 10;
        h = h.wrapping_add(h << 3);
        h ^= h >> 6;
        h = h.wrapping_add((h << 2).wrapping_add(h << 14));
        h ^ (h >> 16)
    }

    #[inline]
    fn segment_for(&self, hash: u32) -> &Segment<K> {
        let idx = ((hash as u64 >> self.segment_shift) as u32 & self.segment_mask) as usize;
        &self.segments[idx]
    }

    /// Look up `key`, retaining the value and promoting it in its segment's
    /// LRU. The guard releases on drop.
    pub fn get(&self, key: &K) -> Option<ValueRef<K>> {
        let hash = self.hash(key);
        self.segment_for(hash)
            .get(key, hash)
            .map(ValueRef::from_retained)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let hash = self.hash(key);
        self.segment_for(hash).contains_key(key, hash)
    }

    /// Insert or replace; a displaced value is released. Returns `true`
    /// when the key was already present.
    pub fn put(&self, key: K, value: Arc<CacheValue<K>>) -> bool {
        let hash = self.hash(&key);
        self.segment_for(hash).put(key, hash, value, false)
    }

    /// Insert only when absent. When the key is present the incoming value
    /// is released and `false` is returned.
    pub fn put_if_absent(&self, key: K, value: Arc<CacheValue<K>>) -> bool {
        let hash = self.hash(&key);
        !self.segment_for(hash).put(key, hash, value, true)
    }

    /// Remove by key, releasing the stored value. Returns `true` when a
    /// mapping existed.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        self.segment_for(hash).remove(key, hash)
    }

    /// Release every entry in every segment.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Lock-free sum of segment counts with no stability check.
    pub fn quick_size(&self) -> usize {
        self.segments.iter().map(|s| s.count()).sum()
    }

    /// Best-effort consistent size: accepts an unlocked double sample when
    /// no mod counter moved, otherwise locks all segments and sums exactly.
    pub fn size(&self) -> usize {
        for _ in 0..RETRIES_BEFORE_LOCK {
            let mut sum = 0usize;
            let mut mc_sum = 0u64;
            let mc: Vec<u64> = self
                .segments
                .iter()
                .map(|s| {
                    sum += s.count();
                    let m = s.mod_count();
                    mc_sum = mc_sum.wrapping_add(m);
                    m
                })
                .collect();

            if mc_sum == 0 {
                return sum;
            }

            let mut check = 0usize;
            let mut stable = true;
            for (segment, &m) in self.segments.iter().zip(mc.iter()) {
                check += segment.count();
                if segment.mod_count() != m {
                    stable = false;
                    break;
                }
            }
            if stable && check == sum {
                return sum;
            }
        }

        // Locked fallback: hold every segment's read lock, then sum.
        let guards: Vec<_> = self.segments.iter().map(|s| s.lock_shared()).collect();
        let sum = self.segments.iter().map(|s| s.count()).sum();
        drop(guards);
        sum
    }

    /// Emptiness check with the same ABA protection as `size`.
    pub fn is_empty(&self) -> bool {
        let mut mc_sum = 0u64;
        let mc: Vec<u64> = self
            .segments
            .iter()
            .map(|s| {
                let m = s.mod_count();
                mc_sum = mc_sum.wrapping_add(m);
                m
            })
            .collect();
        if self.segments.iter().any(|s| s.count() != 0) {
            return false;
        }
        if mc_sum != 0 {
            for (segment, &m) in self.segments.iter().zip(mc.iter()) {
                if segment.count() != 0 || segment.mod_count() != m {
                    return false;
                }
            }
        }
        true
    }

    /// Advisory eviction candidates: the `n` LRU tails of the one segment
    /// `key_hint` maps to. Callers needing a global view sweep all segments
    /// via [`ConcurrentMap::evict_candidates_in`].
    pub fn evict_candidates(&self, key_hint: &K, n: usize) -> Vec<Arc<CacheValue<K>>> {
        let hash = self.hash(key_hint);
        self.segment_for(hash).tails(n)
    }

    /// The `n` LRU tails of segment `segment_idx`.
    pub fn evict_candidates_in(&self, segment_idx: usize, n: usize) -> Vec<Arc<CacheValue<K>>> {
        self.segments[segment_idx].tails(n)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Snapshot of every key. Weakly consistent: concurrent writers may or
    /// may not be reflected.
    pub fn keys(&self) -> Vec<K> {
        let mut out = Vec::new();
        for segment in self.segments.iter() {
            segment.keys_into(&mut out);
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn check_segment_invariants(&self) {
        for (i, segment) in self.segments.iter().enumerate() {
            assert_eq!(
                segment.count(),
                segment.walk_count(),
                "segment {i}: count out of sync with table"
            );
            assert_eq!(
                segment.count(),
                segment.lru_len(),
                "segment {i}: lru out of sync with table"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn segment_table_capacity(&self, key: &K) -> usize {
        let hash = self.hash(key);
        self.segment_for(hash).table_capacity()
    }
}
