//! Pooled native-memory allocator.
//!
//! Serves variable-length allocations out of fixed 16 MiB chunks without
//! touching the OS allocator on the hot path. The facade owns an array of
//! independent arenas; each thread is assigned the least-loaded arena on
//! first use and stays sticky to it, so unrelated threads rarely contend.

mod arena;
mod buffer;
mod chunk;
mod subpage;
mod thread_cache;

pub use buffer::ByteBuf;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::{CHUNK_SIZE, MAX_ORDER, PAGE_SIZE};
use crate::error::Result;
use crate::stats::{AllocatorMetrics, AllocatorStats};

use arena::Arena;
use chunk::Geometry;

/// Distinguishes allocators so thread-local caches never cross instances.
static NEXT_ALLOCATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Facade over a set of arenas sharing one byte budget.
///
/// `Allocator` is `Send + Sync`; clones of the handed-out [`ByteBuf`]s keep
/// their arena alive, so the allocator itself may be dropped while buffers
/// are outstanding.
pub struct Allocator {
    id: u64,
    arenas: Vec<Arc<Arena>>,
    capacity: usize,
    metrics: Arc<AllocatorMetrics>,
}

impl Allocator {
    /// Create an allocator with `capacity` total bytes across `arena_count`
    /// arenas (clamped to >= 1). Each arena receives a chunk budget of
    /// `ceil(capacity / (arenas * chunk_size))`.
    pub fn new(capacity: usize, arena_count: usize) -> Self {
        Self::with_tuning(capacity, arena_count, 256, 8192)
    }

    /// Create an allocator with `2 * num_cpus` arenas.
    pub fn with_default_arenas(capacity: usize) -> Self {
        Self::new(capacity, (num_cpus::get() * 2).max(1))
    }

    /// Full-control constructor; `cache_ring_size` and `cache_trim_interval`
    /// tune the per-thread free-handle cache.
    pub fn with_tuning(
        capacity: usize,
        arena_count: usize,
        cache_ring_size: usize,
        cache_trim_interval: usize,
    ) -> Self {
        let arena_count = arena_count.max(1);
        let id = NEXT_ALLOCATOR_ID.fetch_add(1, Ordering::Relaxed);
        let geom = Geometry::new(PAGE_SIZE, MAX_ORDER);
        let budget_chunks = capacity.div_ceil(arena_count * CHUNK_SIZE).max(1);
        let metrics = Arc::new(AllocatorMetrics::default());

        let arenas = (0..arena_count)
            .map(|i| {
                Arc::new(Arena::new(
                    i,
                    id,
                    geom,
                    budget_chunks,
                    cache_ring_size,
                    cache_trim_interval.max(1),
                    Arc::clone(&metrics),
                ))
            })
            .collect();

        log::info!(
            "allocator {id}: {capacity} bytes across {arena_count} arena(s), {budget_chunks} chunk(s) each"
        );
        Self {
            id,
            arenas,
            capacity,
            metrics,
        }
    }

    /// Allocate a buffer of at least `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<ByteBuf> {
        let served = thread_cache::with_cache(
            self.id,
            || self.least_loaded_arena(),
            |cache| {
                let arena = Arc::clone(&cache.arena);
                arena.allocate(Some(cache), size)
            },
        );
        match served {
            Some(result) => result,
            // TLS teardown: allocate without a cache.
            None => self.least_loaded_arena().allocate(None, size),
        }
    }

    /// Allocate and fill a buffer with `data`; `len()` equals `data.len()`.
    pub fn new_buffer(&self, data: &[u8]) -> Result<ByteBuf> {
        let mut buf = self.allocate(data.len())?;
        buf.write(data)?;
        Ok(buf)
    }

    /// Bytes currently held by live buffers across all arenas.
    pub fn used(&self) -> usize {
        self.arenas.iter().map(|a| a.used()).sum()
    }

    /// Total configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn arena_count(&self) -> usize {
        self.arenas.len()
    }

    pub fn metrics(&self) -> AllocatorStats {
        self.metrics.snapshot()
    }

    /// Multi-line dump of every arena's bands and subpage pools.
    pub fn dump(&self) -> String {
        self.arenas.iter().map(|a| a.to_string()).collect()
    }

    fn least_loaded_arena(&self) -> Arc<Arena> {
        let arena = self
            .arenas
            .iter()
            .min_by_key(|a| a.thread_cache_count())
            .expect("at least one arena");
        Arc::clone(arena)
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for arena in &self.arenas {
            arena.check_band_invariant();
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_chunk_count(&self) -> usize {
        self.arenas.iter().map(|a| a.pooled_chunk_count()).sum()
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("arenas", &self.arenas.len())
            .field("used", &self.used())
            .finish()
    }
}
