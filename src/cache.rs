//! Public cache facade.
//!
//! Ties the pool allocator and the concurrent map together: `set` copies the
//! caller's bytes into native memory and publishes a value entry; `get`
//! copies them back out. When the allocator reports exhaustion, `set` asks
//! the eviction policy for victims, releases them and retries a bounded
//! number of times; eviction-driven retry lives here, above the core.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::alloc::{Allocator, ByteBuf};
use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::map::{CacheValue, ConcurrentMap, ValueRef};
use crate::stats::{AllocatorStats, CacheMetrics, CacheStats};

/// Keys evicted per retry round when the allocator is full.
const EVICT_BATCH: usize = 8;

/// Strategy for picking eviction victims when the allocator is full.
///
/// The core only offers per-segment LRU tails; a policy decides how to
/// sweep them into a candidate set.
pub trait EvictionPolicy<K>: Send + Sync {
    /// Pick up to `batch` keys to evict, coldest preferred.
    fn select(&self, map: &ConcurrentMap<K>, batch: usize) -> Vec<K>;
}

/// Default policy: sweep every segment's LRU tail.
pub struct LruEviction;

impl<K: Hash + Eq + Clone> EvictionPolicy<K> for LruEviction {
    fn select(&self, map: &ConcurrentMap<K>, batch: usize) -> Vec<K> {
        let per_segment = batch.div_ceil(map.segment_count()).max(1);
        let mut keys = Vec::new();
        for i in 0..map.segment_count() {
            for victim in map.evict_candidates_in(i, per_segment) {
                keys.push(victim.key().clone());
                if keys.len() >= batch {
                    return keys;
                }
            }
        }
        keys
    }
}

/// In-process key-value cache with off-heap values.
///
/// Keys stay ordinary owned values; payloads are byte slices copied into
/// pooled native memory, out of reach of any managed-heap scanning.
///
/// # Examples
///
/// ```rust
/// use offheap::{Cache, CacheConfig};
///
/// let cache: Cache<String> = Cache::new(CacheConfig::default())?;
/// cache.set("user:1".to_string(), b"profile bytes")?;
/// assert_eq!(cache.get(&"user:1".to_string()).as_deref(), Some(&b"profile bytes"[..]));
/// # Ok::<(), offheap::CacheError>(())
/// ```
pub struct Cache<K> {
    allocator: Arc<Allocator>,
    map: ConcurrentMap<K>,
    policy: Box<dyn EvictionPolicy<K>>,
    max_retries: usize,
    metrics: Arc<CacheMetrics>,
}

impl<K: Hash + Eq + Clone> Cache<K> {
    /// Build a cache with the default LRU eviction policy.
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::with_policy(config, Box::new(LruEviction))
    }

    /// Build a cache with a custom eviction policy.
    pub fn with_policy(config: CacheConfig, policy: Box<dyn EvictionPolicy<K>>) -> Result<Self> {
        config.validate()?;
        let allocator = Allocator::with_tuning(
            config.max_memory_size,
            config.resolved_arena_count(),
            config.thread_cache_size,
            config.thread_cache_trim_interval,
        );
        let map = ConcurrentMap::new(
            config.initial_capacity,
            config.load_factor,
            config.concurrency,
        )?;

        Ok(Self {
            allocator: Arc::new(allocator),
            map,
            policy,
            max_retries: config.max_retries_on_full,
            metrics: Arc::new(CacheMetrics::default()),
        })
    }

    /// Store `value` under `key`, replacing (and releasing) any previous
    /// mapping.
    pub fn set(&self, key: K, value: &[u8]) -> Result<()> {
        self.set_with_ttl(key, value, None)
    }

    /// Store with a time-to-live; expired entries read as misses and are
    /// removed lazily on access.
    pub fn set_with_ttl(&self, key: K, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let buf = self.allocate_with_retry(value)?;
        let entry = Arc::new(CacheValue::with_ttl(key.clone(), buf, ttl));
        self.map.put(key, entry);
        self.metrics
            .puts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Store only when `key` has no live mapping. Returns `true` when the
    /// value was installed.
    pub fn set_if_absent(&self, key: K, value: &[u8]) -> Result<bool> {
        let buf = self.allocate_with_retry(value)?;
        let entry = Arc::new(CacheValue::new(key.clone(), buf));
        let installed = self.map.put_if_absent(key, entry);
        if installed {
            self.metrics
                .puts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(installed)
    }

    /// Copy the value for `key` out of native memory.
    pub fn get(&self, key: &K) -> Option<Vec<u8>> {
        let Some(entry) = self.map.get(key) else {
            self.metrics
                .misses
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        };

        if entry.expired() {
            drop(entry);
            // Best effort: a replacement racing in between get and remove
            // may be dropped early; expiry is advisory, not transactional.
            self.map.remove(key);
            self.metrics
                .expirations
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.metrics
                .misses
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return None;
        }

        match entry.read_bytes() {
            Ok(bytes) => {
                self.metrics
                    .hits
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Some(bytes)
            }
            Err(_) => {
                self.metrics
                    .misses
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                None
            }
        }
    }

    /// Borrow the live entry without copying the payload. The guard holds a
    /// reference; the value cannot be returned to its arena while it lives.
    pub fn get_entry(&self, key: &K) -> Option<ValueRef<K>> {
        self.map.get(key)
    }

    /// Serialize `value` as JSON and store it.
    pub fn put_json<T: Serialize>(&self, key: K, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes)
    }

    /// Fetch and deserialize a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &K) -> Result<Option<T>> {
        match self.get(key) {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove `key`, releasing its value. Returns `true` when a mapping
    /// existed.
    pub fn remove(&self, key: &K) -> bool {
        let removed = self.map.remove(key);
        if removed {
            self.metrics
                .removes
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        removed
    }

    /// Whether `key` has a mapping. Expired-but-unswept entries count as
    /// present until the next `get` removes them.
    pub fn exists(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Entry count with the size-stability protocol.
    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Lock-free entry count; may be stale under concurrent writers.
    pub fn quick_size(&self) -> usize {
        self.map.quick_size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Release every entry.
    pub fn clear(&self) {
        self.map.clear();
    }

    /// Bytes held by live values.
    pub fn used(&self) -> usize {
        self.allocator.used()
    }

    /// Configured off-heap budget in bytes.
    pub fn capacity(&self) -> usize {
        self.allocator.capacity()
    }

    /// Weakly consistent key snapshot.
    pub fn keys(&self) -> Vec<K> {
        self.map.keys()
    }

    pub fn metrics(&self) -> CacheStats {
        self.metrics.snapshot()
    }

    pub fn allocator_metrics(&self) -> AllocatorStats {
        self.allocator.metrics()
    }

    /// The underlying map, for advanced callers (eviction sweeps,
    /// candidate inspection).
    pub fn map(&self) -> &ConcurrentMap<K> {
        &self.map
    }

    /// Multi-line dump of allocator state, for diagnostics.
    pub fn dump_allocator(&self) -> String {
        self.allocator.dump()
    }

    fn allocate_with_retry(&self, value: &[u8]) -> Result<ByteBuf> {
        let mut attempt = 0;
        loop {
            match self.allocator.new_buffer(value) {
                Ok(buf) => return Ok(buf),
                Err(err @ CacheError::AllocationFailure { .. }) => {
                    if attempt >= self.max_retries || self.evict_batch() == 0 {
                        return Err(err);
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Evict one batch of policy-selected victims; returns how many entries
    /// actually left the map.
    fn evict_batch(&self) -> usize {
        let keys = self.policy.select(&self.map, EVICT_BATCH);
        let mut evicted = 0;
        for key in keys {
            if self.map.remove(&key) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.metrics
                .evictions
                .fetch_add(evicted as u64, std::sync::atomic::Ordering::Relaxed);
            log::debug!("evicted {evicted} entries under memory pressure");
        }
        evicted
    }
}
