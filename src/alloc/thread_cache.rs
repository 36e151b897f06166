//! Per-thread cache of recently freed allocation handles.
//!
//! Frees performed by the thread that owns an allocation are parked in
//! bounded per-size-class rings instead of going back through the arena
//! lock; the next same-class allocation from the same thread reuses the
//! handle with no contention at all. The chunk never saw the free, so reuse
//! is simply handing the identical range back out.
//!
//! Rings are bounded: a full ring rejects the push and the handle takes the
//! normal arena path. A periodic trim returns entries that stopped being
//! reused, and thread exit drains everything back to the arena.

use std::cell::{Cell, RefCell};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use indexmap::IndexMap;

use crate::memory::Region;

use super::arena::{Arena, NUM_TINY_POOLS};

/// Normal-size classes cached per thread: `page`, `2*page`, `4*page`.
/// Anything larger always goes through the arena.
pub(crate) const NUM_NORMAL_RINGS: usize = 3;

/// A freed allocation parked in a ring, ready for same-thread reuse.
pub(crate) struct CachedRun {
    pub chunk_id: u32,
    pub handle: u64,
    pub region: Arc<Region>,
}

/// One bounded ring for a single `(arena, size-class)` pair.
struct Ring {
    queue: ArrayQueue<CachedRun>,
    /// Pops since the last trim; a ring that is not being popped gets
    /// drained back to the arena.
    hits: Cell<usize>,
}

impl Ring {
    fn new(size: usize) -> Self {
        Self {
            queue: ArrayQueue::new(size.max(1)),
            hits: Cell::new(0),
        }
    }

    fn pop(&self) -> Option<CachedRun> {
        let run = self.queue.pop()?;
        self.hits.set(self.hits.get() + 1);
        Some(run)
    }

    /// On a full ring the run comes back to the caller untouched.
    fn push(&self, run: CachedRun) -> Result<(), CachedRun> {
        self.queue.push(run)
    }

    fn trim(&self, arena: &Arena) {
        let keep = self.hits.replace(0);
        let excess = self.queue.len().saturating_sub(keep);
        for _ in 0..excess {
            match self.queue.pop() {
                Some(run) => arena.free_direct(run.chunk_id, run.handle),
                None => break,
            }
        }
    }

    fn drain(&self, arena: &Arena) {
        while let Some(run) = self.queue.pop() {
            arena.free_direct(run.chunk_id, run.handle);
        }
    }
}

/// All rings a thread holds for one arena. A thread is sticky to a single
/// arena per allocator, so this is also the thread's cache for that
/// allocator.
pub(crate) struct ThreadArenaCache {
    pub(crate) arena: Arc<Arena>,
    tiny: Vec<Ring>,
    small: Vec<Ring>,
    normal: Vec<Ring>,
    allocations: Cell<usize>,
    trim_interval: usize,
}

impl ThreadArenaCache {
    pub(crate) fn new(arena: Arc<Arena>) -> Self {
        let ring_size = arena.cache_ring_size();
        let trim_interval = arena.cache_trim_interval();

        // Index 0 of the tiny array is the unused zero-size class.
        let tiny = (0..NUM_TINY_POOLS).map(|_| Ring::new(ring_size)).collect();
        let small = (0..arena.num_small_pools())
            .map(|_| Ring::new((ring_size / 2).max(1)))
            .collect();
        let normal = (0..NUM_NORMAL_RINGS)
            .map(|_| Ring::new((ring_size / 4).max(1)))
            .collect();

        arena.register_thread_cache();
        Self {
            arena,
            tiny,
            small,
            normal,
            allocations: Cell::new(0),
            trim_interval,
        }
    }

    fn ring_for(&self, norm_capacity: usize) -> Option<&Ring> {
        let page = self.arena.page_size();
        if norm_capacity < 512 {
            self.tiny.get(norm_capacity >> 4)
        } else if norm_capacity < page {
            let idx = (norm_capacity / 512).ilog2() as usize;
            self.small.get(idx)
        } else if norm_capacity <= page << (NUM_NORMAL_RINGS - 1) {
            let idx = (norm_capacity / page).ilog2() as usize;
            if norm_capacity == page << idx {
                self.normal.get(idx)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Reuse a cached handle of exactly `norm_capacity`, if any.
    pub(crate) fn allocate(&self, norm_capacity: usize) -> Option<CachedRun> {
        let run = self.ring_for(norm_capacity)?.pop()?;

        let n = self.allocations.get() + 1;
        self.allocations.set(n);
        if n % self.trim_interval == 0 {
            self.trim_all();
        }
        Some(run)
    }

    /// Park a freed handle. On `Err` the ring was full (or the class is not
    /// cached) and the caller must return the handle through the arena.
    pub(crate) fn add(&self, norm_capacity: usize, run: CachedRun) -> Result<(), CachedRun> {
        match self.ring_for(norm_capacity) {
            Some(ring) => ring.push(run),
            None => Err(run),
        }
    }

    fn trim_all(&self) {
        for ring in self
            .tiny
            .iter()
            .chain(self.small.iter())
            .chain(self.normal.iter())
        {
            ring.trim(&self.arena);
        }
    }
}

impl Drop for ThreadArenaCache {
    fn drop(&mut self) {
        for ring in self
            .tiny
            .iter()
            .chain(self.small.iter())
            .chain(self.normal.iter())
        {
            ring.drain(&self.arena);
        }
        self.arena.unregister_thread_cache();
    }
}

thread_local! {
    /// One cache per allocator this thread has touched, keyed by allocator
    /// id. Dropped on thread exit, draining every ring to its arena.
    static CACHES: RefCell<IndexMap<u64, ThreadArenaCache>> = RefCell::new(IndexMap::new());
}

/// Run `f` against this thread's cache for `allocator_id`, creating it (and
/// binding the thread to an arena) on first use. Returns `None` only during
/// thread teardown when the TLS slot is gone.
pub(crate) fn with_cache<R>(
    allocator_id: u64,
    pick_arena: impl FnOnce() -> Arc<Arena>,
    f: impl FnOnce(&ThreadArenaCache) -> R,
) -> Option<R> {
    CACHES
        .try_with(|caches| {
            let mut caches = caches.borrow_mut();
            let cache = caches
                .entry(allocator_id)
                .or_insert_with(|| ThreadArenaCache::new(pick_arena()));
            f(cache)
        })
        .ok()
}

/// Offer a freed handle to this thread's cache, but only when the thread is
/// actually bound to the freeing arena. `None` means the cache kept the
/// handle; `Some(run)` comes back when the ring is full, the thread is not
/// the owner, or TLS is being torn down; the caller then takes the arena
/// path.
pub(crate) fn offer(
    allocator_id: u64,
    arena_id: usize,
    norm_capacity: usize,
    run: CachedRun,
) -> Option<CachedRun> {
    let mut slot = Some(run);
    let accepted = CACHES
        .try_with(|caches| {
            let caches = caches.borrow();
            match caches.get(&allocator_id) {
                Some(cache) if cache.arena.id() == arena_id => {
                    match cache.add(norm_capacity, slot.take().expect("run present")) {
                        Ok(()) => true,
                        Err(run) => {
                            slot = Some(run);
                            false
                        }
                    }
                }
                _ => false,
            }
        })
        .unwrap_or(false);

    if accepted {
        None
    } else {
        slot
    }
}
