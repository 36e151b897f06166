//! # offheap - Off-Heap Key-Value Cache
//!
//! An in-process key-value cache whose values live in native memory, out of
//! reach of any managed-heap scanning. Keys remain ordinary owned values;
//! payloads are byte slices copied in and out of pooled native regions. The
//! target workload is large payloads (kilobytes to megabytes) held in
//! aggregates from hundreds of megabytes to tens of gigabytes.
//!
//! ## Overview
//!
//! Two subsystems carry the design:
//!
//! - **A size-class pool allocator** that serves variable-length requests
//!   out of fixed 16 MiB chunks without calling the OS allocator on the hot
//!   path. Each chunk manages its pages with a buddy-style tree; sub-page
//!   requests share a page through bitmap-tracked subpage splitters; chunks
//!   are binned into utilization bands; per-thread caches recycle freed
//!   handles with zero contention.
//! - **A segmented concurrent map** indexing the live values. Each segment
//!   carries its own reader-writer lock, rehashable bucket table and an
//!   intrusive LRU list feeding eviction-candidate selection.
//!
//! The two meet at the value lifecycle: entries are reference counted, the
//! hash table holds one reference, and a segment's write lock is the
//! serialization point for both index mutation and memory release.
//!
//! ## Quick Start
//!
//! ```rust
//! use offheap::{Cache, CacheConfig};
//!
//! fn main() -> Result<(), offheap::CacheError> {
//!     let cache: Cache<String> = Cache::new(CacheConfig {
//!         max_memory_size: 256 * 1024 * 1024,
//!         ..Default::default()
//!     })?;
//!
//!     cache.set("session:42".to_string(), b"serialized session")?;
//!     assert!(cache.exists(&"session:42".to_string()));
//!
//!     let bytes = cache.get(&"session:42".to_string());
//!     assert_eq!(bytes.as_deref(), Some(&b"serialized session"[..]));
//!
//!     cache.remove(&"session:42".to_string());
//!     assert_eq!(cache.used(), 0);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! set(key, bytes)                         get(key)
//!       │                                     │
//!       ▼                                     ▼
//! ┌──────────────┐  handle   ┌─────────────────────────────┐
//! │  Allocator    │◄────────►│  ConcurrentMap               │
//! │  ┌─────────┐ │           │  ┌─────────┐  ┌─────────┐   │
//! │  │ Arena 0 │ │           │  │ Segment │  │ Segment │ … │
//! │  │ chunks  │ │           │  │ rw-lock │  │ rw-lock │   │
//! │  │ bands   │ │           │  │ buckets │  │ buckets │   │
//! │  └─────────┘ │           │  │ LRU     │  │ LRU     │   │
//! │  ┌─────────┐ │           │  └─────────┘  └─────────┘   │
//! │  │ Arena 1 │ │           └─────────────────────────────┘
//! │  └─────────┘ │
//! │  thread-local │
//! │  handle cache │
//! └──────────────┘
//! ```
//!
//! ## Concurrency
//!
//! - Arena locks are fine-grained and independent; a thread is sticky to
//!   one arena, and same-thread frees bypass the lock entirely through the
//!   thread-local handle cache.
//! - Segment writes are linearizable per segment; `size()` is a best-effort
//!   consistent snapshot (mod-count stability protocol).
//! - A segment lock may be held while releasing memory into an arena; arena
//!   locks are lower in the order and never re-enter a segment.
//!
//! ## Modules
//!
//! - [`cache`]: public facade (`set`/`get`/`remove`, eviction retry, JSON)
//! - [`alloc`]: pooled allocator (arenas, chunks, subpages, thread caches)
//! - [`map`]: segmented concurrent map, LRU lists, value lifecycle
//! - [`memory`]: raw native regions
//! - [`config`]: construction parameters and validation
//! - [`error`]: error taxonomy
//! - [`stats`]: allocator and cache counters
//! - [`util`]: size parsing and helpers

pub mod cache;
pub mod config;
pub mod error;
pub mod stats;
pub mod util;

// Memory subsystems
pub mod alloc;
pub mod map;
pub mod memory;

pub use alloc::{Allocator, ByteBuf};
pub use cache::{Cache, EvictionPolicy, LruEviction};
pub use config::CacheConfig;
pub use error::{CacheError, ConfigError, Result};
pub use map::{CacheValue, ConcurrentMap, ValueRef};
pub use stats::{AllocatorStats, CacheStats};

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build a cache over `capacity` bytes with default settings.
pub fn with_capacity<K: std::hash::Hash + Eq + Clone>(capacity: usize) -> Result<Cache<K>> {
    Cache::new(CacheConfig {
        max_memory_size: capacity,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_capacity() {
        let cache: Cache<String> = with_capacity(util::size::mb(64)).unwrap();
        assert_eq!(cache.capacity(), util::size::mb(64));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_version_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
