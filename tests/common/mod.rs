//! Shared fixtures for the integration suites.
#![allow(dead_code)] // each suite uses a different subset

use offheap::{Cache, CacheConfig};

/// Cache most suites use: 256 MiB budget, 1000 buckets,
/// load factor 0.75, 16 segments.
pub fn standard_cache() -> Cache<String> {
    Cache::new(CacheConfig {
        max_memory_size: 256 * 1024 * 1024,
        arena_count: Some(4),
        concurrency: 16,
        initial_capacity: 1000,
        load_factor: 0.75,
        ..Default::default()
    })
    .expect("valid standard config")
}

/// Small cache with a hard budget and no evict-and-retry, so allocator
/// exhaustion surfaces to the caller.
pub fn strict_cache(max_memory: usize) -> Cache<String> {
    Cache::new(CacheConfig {
        max_memory_size: max_memory,
        arena_count: Some(1),
        concurrency: 4,
        initial_capacity: 64,
        load_factor: 0.75,
        max_retries_on_full: 0,
        ..Default::default()
    })
    .expect("valid strict config")
}

/// Sum of live buffer capacities reachable through the cache, for checking
/// `used()` against ground truth.
pub fn live_capacity(cache: &Cache<String>) -> usize {
    cache
        .keys()
        .into_iter()
        .filter_map(|k| cache.get_entry(&k))
        .map(|entry| entry.capacity())
        .sum()
}
