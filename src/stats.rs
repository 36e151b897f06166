//! Performance counters for the allocator and the cache facade.
//!
//! Counters are plain relaxed atomics: cheap to bump on hot paths, read as a
//! point-in-time snapshot for monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters owned by an allocator and shared with its arenas.
#[derive(Debug, Default)]
pub struct AllocatorMetrics {
    pub(crate) allocations: AtomicU64,
    pub(crate) frees: AtomicU64,
    pub(crate) thread_cache_hits: AtomicU64,
    pub(crate) chunks_created: AtomicU64,
    pub(crate) chunks_destroyed: AtomicU64,
    pub(crate) huge_allocations: AtomicU64,
}

impl AllocatorMetrics {
    pub fn snapshot(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            thread_cache_hits: self.thread_cache_hits.load(Ordering::Relaxed),
            chunks_created: self.chunks_created.load(Ordering::Relaxed),
            chunks_destroyed: self.chunks_destroyed.load(Ordering::Relaxed),
            huge_allocations: self.huge_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`AllocatorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub frees: u64,
    pub thread_cache_hits: u64,
    pub chunks_created: u64,
    pub chunks_destroyed: u64,
    pub huge_allocations: u64,
}

/// Live counters owned by a cache facade.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) puts: AtomicU64,
    pub(crate) removes: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) expirations: AtomicU64,
}

impl CacheMetrics {
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub removes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

impl CacheStats {
    /// Hit ratio over `hits + misses`, or 0 when nothing was read yet.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = AllocatorMetrics::default();
        m.allocations.fetch_add(3, Ordering::Relaxed);
        m.frees.fetch_add(2, Ordering::Relaxed);

        let s = m.snapshot();
        assert_eq!(s.allocations, 3);
        assert_eq!(s.frees, 2);
        assert_eq!(s.chunks_created, 0);
    }

    #[test]
    fn test_hit_ratio() {
        let m = CacheMetrics::default();
        assert_eq!(m.snapshot().hit_ratio(), 0.0);
        m.hits.fetch_add(3, Ordering::Relaxed);
        m.misses.fetch_add(1, Ordering::Relaxed);
        assert!((m.snapshot().hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
