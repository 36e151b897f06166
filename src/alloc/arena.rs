//! Arena: one independent partition of the pool allocator.
//!
//! An arena aggregates chunks into utilization bands and keeps size-class
//! pools of partially-filled subpages. One mutex serializes every
//! cross-thread allocate/free; thread-cache hits never reach it.
//!
//! Utilization bands (percent-full ranges):
//!
//! ```text
//! qInit [MIN,25)   q000 [1,50)   q025 [25,75)
//! q050  [50,100)   q075 [75,100) q100 [100,MAX)
//! ```
//!
//! A chunk always lives in exactly one band; crossing a range boundary on
//! allocate or free moves it to the adjacent band. Falling below q000's
//! floor destroys the chunk, the only path that returns native memory to
//! the OS during normal operation. The allocate scan favors busy-but-not-
//! saturated chunks for locality: `q050, q025, q000, qInit, q075, q100`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::memory::Region;
use crate::stats::AllocatorMetrics;

use super::buffer::ByteBuf;
use super::chunk::{Chunk, FreeOutcome, Geometry};
use super::thread_cache::{self, CachedRun, ThreadArenaCache};

/// Tiny size classes: 16-byte quantum below 512. Index 0 (the zero-size
/// class) is never populated; displays walk from index 1.
pub(crate) const NUM_TINY_POOLS: usize = 512 >> 4;

const QINIT: usize = 0;
const Q000: usize = 1;
const Q025: usize = 2;
const Q050: usize = 3;
const Q075: usize = 4;
const Q100: usize = 5;

/// Band scan order for allocation.
const ALLOC_BAND_ORDER: [usize; 6] = [Q050, Q025, Q000, QINIT, Q075, Q100];

struct Band {
    name: &'static str,
    min_usage: i32,
    max_usage: i32,
    next: Option<usize>,
    /// `None` means a chunk falling out of this band is destroyed. qInit
    /// points at itself: brand-new chunks are never destroyed.
    prev: Option<usize>,
    chunks: Vec<u32>,
}

fn new_bands() -> [Band; 6] {
    [
        Band {
            name: "qInit",
            min_usage: i32::MIN,
            max_usage: 25,
            next: Some(Q000),
            prev: Some(QINIT),
            chunks: Vec::new(),
        },
        Band {
            name: "q000",
            min_usage: 1,
            max_usage: 50,
            next: Some(Q025),
            prev: None,
            chunks: Vec::new(),
        },
        Band {
            name: "q025",
            min_usage: 25,
            max_usage: 75,
            next: Some(Q050),
            prev: Some(Q000),
            chunks: Vec::new(),
        },
        Band {
            name: "q050",
            min_usage: 50,
            max_usage: 100,
            next: Some(Q075),
            prev: Some(Q025),
            chunks: Vec::new(),
        },
        Band {
            name: "q075",
            min_usage: 75,
            max_usage: 100,
            next: Some(Q100),
            prev: Some(Q050),
            chunks: Vec::new(),
        },
        Band {
            name: "q100",
            min_usage: 100,
            max_usage: i32::MAX,
            next: None,
            prev: Some(Q075),
            chunks: Vec::new(),
        },
    ]
}

/// Reference to a live subpage with free slots, parked in a size-class pool.
/// Validated lazily at pop: the chunk or subpage may be gone, or the leaf
/// may have been resplit for a different class.
#[derive(Clone, Copy)]
struct PoolRef {
    chunk_id: u32,
    mm_idx: u32,
}

struct ArenaInner {
    chunks: Vec<Option<Chunk>>,
    free_slots: Vec<u32>,
    bands: [Band; 6],
    tiny_pools: Vec<Vec<PoolRef>>,
    small_pools: Vec<Vec<PoolRef>>,
    /// Pooled (tree-managed) chunks currently alive; bounded by the budget.
    pooled_chunks: usize,
}

/// One allocator partition. Arenas are independent: no thread ever holds two
/// arena locks at once.
pub(crate) struct Arena {
    id: usize,
    alloc_id: u64,
    geom: Geometry,
    budget_chunks: usize,
    inner: Mutex<ArenaInner>,
    used: AtomicUsize,
    thread_caches: AtomicUsize,
    cache_ring_size: usize,
    cache_trim_interval: usize,
    metrics: Arc<AllocatorMetrics>,
}

impl Arena {
    pub(crate) fn new(
        id: usize,
        alloc_id: u64,
        geom: Geometry,
        budget_chunks: usize,
        cache_ring_size: usize,
        cache_trim_interval: usize,
        metrics: Arc<AllocatorMetrics>,
    ) -> Self {
        let num_small = (geom.page_shifts - 9) as usize;
        Self {
            id,
            alloc_id,
            geom,
            budget_chunks,
            inner: Mutex::new(ArenaInner {
                chunks: Vec::new(),
                free_slots: Vec::new(),
                bands: new_bands(),
                tiny_pools: (0..NUM_TINY_POOLS).map(|_| Vec::new()).collect(),
                small_pools: (0..num_small).map(|_| Vec::new()).collect(),
                pooled_chunks: 0,
            }),
            used: AtomicUsize::new(0),
            thread_caches: AtomicUsize::new(0),
            cache_ring_size,
            cache_trim_interval,
            metrics,
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn page_size(&self) -> usize {
        self.geom.page_size
    }

    pub(crate) fn num_small_pools(&self) -> usize {
        (self.geom.page_shifts - 9) as usize
    }

    pub(crate) fn cache_ring_size(&self) -> usize {
        self.cache_ring_size
    }

    pub(crate) fn cache_trim_interval(&self) -> usize {
        self.cache_trim_interval
    }

    pub(crate) fn register_thread_cache(&self) {
        self.thread_caches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unregister_thread_cache(&self) {
        self.thread_caches.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn thread_cache_count(&self) -> usize {
        self.thread_caches.load(Ordering::Relaxed)
    }

    /// Bytes held by live buffers of this arena.
    pub(crate) fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Byte capacity this arena may grow to.
    pub(crate) fn capacity(&self) -> usize {
        self.budget_chunks * self.geom.chunk_size
    }

    /// Normalize a requested capacity into the size class actually served:
    /// identity at or above chunk size (unpooled), next power of two from
    /// 512 up, 16-byte quantum below 512.
    pub(crate) fn normalize_capacity(&self, req: usize) -> usize {
        if req >= self.geom.chunk_size {
            return req;
        }
        if req >= 512 {
            return req.next_power_of_two();
        }
        if req == 0 {
            return 16;
        }
        (req + 15) & !15
    }

    #[inline]
    fn is_tiny(norm: usize) -> bool {
        norm < 512
    }

    #[inline]
    fn is_tiny_or_small(&self, norm: usize) -> bool {
        norm & !(self.geom.page_size - 1) == 0
    }

    #[inline]
    fn small_idx(norm: usize) -> usize {
        debug_assert!(norm >= 512);
        (norm / 512).ilog2() as usize
    }

    /// Allocate `req` bytes, preferring the calling thread's cache.
    pub(crate) fn allocate(
        self: &Arc<Self>,
        cache: Option<&ThreadArenaCache>,
        req: usize,
    ) -> Result<ByteBuf> {
        let norm = self.normalize_capacity(req);
        if norm > self.geom.chunk_size {
            return self.allocate_huge(req);
        }

        if let Some(cache) = cache {
            if let Some(run) = cache.allocate(norm) {
                self.metrics
                    .thread_cache_hits
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(self.finish_alloc(run.chunk_id, run.handle, run.region, norm));
            }
        }

        let (chunk_id, handle, region) = {
            let mut inner = self.inner.lock();
            let pooled = if self.is_tiny_or_small(norm) {
                Self::allocate_from_pool(&mut inner, norm)
            } else {
                None
            };
            match pooled {
                Some(hit) => hit,
                None => self.allocate_normal(&mut inner, norm)?,
            }
        };
        Ok(self.finish_alloc(chunk_id, handle, region, norm))
    }

    fn finish_alloc(
        self: &Arc<Self>,
        chunk_id: u32,
        handle: u64,
        region: Arc<Region>,
        norm: usize,
    ) -> ByteBuf {
        self.used.fetch_add(norm, Ordering::Relaxed);
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        let offset = self.geom.offset_of(handle, norm);
        let max_length = self.geom.max_length_of(handle, norm);
        debug_assert_eq!(max_length, norm, "normalized size matches the run");
        ByteBuf::new_pooled(Arc::clone(self), region, chunk_id, handle, offset, max_length)
    }

    /// Pop the head of the size-class pool and reuse a slot from it,
    /// discarding stale references along the way.
    fn allocate_from_pool(
        inner: &mut ArenaInner,
        norm: usize,
    ) -> Option<(u32, u64, Arc<Region>)> {
        let ArenaInner {
            chunks,
            tiny_pools,
            small_pools,
            ..
        } = inner;
        let pool = if Self::is_tiny(norm) {
            &mut tiny_pools[norm >> 4]
        } else {
            &mut small_pools[Self::small_idx(norm)]
        };

        while let Some(pref) = pool.pop() {
            let Some(chunk) = chunks[pref.chunk_id as usize].as_mut() else {
                continue;
            };
            if chunk.subpage_elem_size(pref.mm_idx as usize) != Some(norm) {
                continue;
            }
            let Some(handle) = chunk.allocate_in_subpage(pref.mm_idx as usize) else {
                continue;
            };
            let region = Arc::clone(&chunk.region);
            // Still has slots: stays at the head of its class list. A full
            // subpage is skipped until a free reopens it.
            if chunk.subpage_has_avail(pref.mm_idx as usize) {
                pool.push(pref);
            }
            return Some((pref.chunk_id, handle, region));
        }
        None
    }

    /// Scan the utilization bands in allocation order; grow by one chunk on
    /// a full miss, within budget.
    fn allocate_normal(
        &self,
        inner: &mut ArenaInner,
        norm: usize,
    ) -> Result<(u32, u64, Arc<Region>)> {
        for &b in &ALLOC_BAND_ORDER {
            let mut i = 0;
            while let Some(cid) = inner.bands[b].chunks.get(i).copied() {
                let chunk = inner.chunks[cid as usize]
                    .as_mut()
                    .expect("band lists hold only live chunks");
                if let Some(handle) = chunk.allocate(norm) {
                    let region = Arc::clone(&chunk.region);
                    self.after_allocate(inner, cid, handle, norm);
                    return Ok((cid, handle, region));
                }
                i += 1;
            }
        }

        if inner.pooled_chunks >= self.budget_chunks {
            return Err(CacheError::AllocationFailure { requested: norm });
        }

        let region = Arc::new(Region::new(self.geom.chunk_size)?);
        let mut chunk = Chunk::new(Arc::clone(&region), self.geom);
        chunk.band = QINIT;
        let handle = chunk
            .allocate(norm)
            .expect("fresh chunk serves any normalized size");

        let cid = Self::insert_chunk(inner, chunk);
        inner.bands[QINIT].chunks.push(cid);
        inner.pooled_chunks += 1;
        self.metrics.chunks_created.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "arena {}: created chunk {} ({} bytes), {}/{} in budget",
            self.id,
            cid,
            self.geom.chunk_size,
            inner.pooled_chunks,
            self.budget_chunks
        );

        self.after_allocate(inner, cid, handle, norm);
        Ok((cid, handle, region))
    }

    /// Huge requests bypass the pool entirely: an unpooled chunk sized to
    /// the request, destroyed on free, never cached.
    fn allocate_huge(self: &Arc<Self>, req: usize) -> Result<ByteBuf> {
        if self.used.load(Ordering::Relaxed) + req > self.capacity() {
            return Err(CacheError::AllocationFailure { requested: req });
        }

        let region = Arc::new(Region::new(req)?);
        let chunk = Chunk::new_unpooled(Arc::clone(&region));
        let cid = {
            let mut inner = self.inner.lock();
            Self::insert_chunk(&mut inner, chunk)
        };

        self.used.fetch_add(req, Ordering::Relaxed);
        self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
        self.metrics.huge_allocations.fetch_add(1, Ordering::Relaxed);
        log::debug!("arena {}: unpooled chunk {} ({} bytes)", self.id, cid, req);
        Ok(ByteBuf::new_unpooled(Arc::clone(self), region, cid))
    }

    fn insert_chunk(inner: &mut ArenaInner, chunk: Chunk) -> u32 {
        match inner.free_slots.pop() {
            Some(slot) => {
                inner.chunks[slot as usize] = Some(chunk);
                slot
            }
            None => {
                inner.chunks.push(Some(chunk));
                (inner.chunks.len() - 1) as u32
            }
        }
    }

    /// Pool and band bookkeeping after a tree allocation.
    fn after_allocate(&self, inner: &mut ArenaInner, cid: u32, handle: u64, norm: usize) {
        if Geometry::is_subpage_handle(handle) {
            let mm_idx = Geometry::mm_idx(handle);
            let has_avail = inner.chunks[cid as usize]
                .as_ref()
                .expect("live chunk")
                .subpage_has_avail(mm_idx);
            if has_avail {
                Self::push_pool_ref(inner, norm, cid, mm_idx);
            }
        }
        self.rebalance(inner, cid);
    }

    fn push_pool_ref(inner: &mut ArenaInner, elem_size: usize, cid: u32, mm_idx: usize) {
        let pref = PoolRef {
            chunk_id: cid,
            mm_idx: mm_idx as u32,
        };
        if Self::is_tiny(elem_size) {
            inner.tiny_pools[elem_size >> 4].push(pref);
        } else {
            inner.small_pools[Self::small_idx(elem_size)].push(pref);
        }
    }

    /// Entry point for buffer release. Decrements `used` unconditionally;
    /// a same-thread free is parked in the thread cache when possible, and
    /// only otherwise pays for the arena lock.
    pub(crate) fn free_buf(
        &self,
        chunk_id: u32,
        handle: u64,
        norm: usize,
        unpooled: bool,
        region: &Arc<Region>,
    ) {
        self.used.fetch_sub(norm, Ordering::Relaxed);
        self.metrics.frees.fetch_add(1, Ordering::Relaxed);

        if unpooled {
            let mut inner = self.inner.lock();
            inner.chunks[chunk_id as usize] = None;
            inner.free_slots.push(chunk_id);
            log::debug!("arena {}: destroyed unpooled chunk {}", self.id, chunk_id);
            return;
        }

        let run = CachedRun {
            chunk_id,
            handle,
            region: Arc::clone(region),
        };
        if let Some(run) = thread_cache::offer(self.alloc_id, self.id, norm, run) {
            let mut inner = self.inner.lock();
            self.free_locked(&mut inner, run.chunk_id, run.handle);
        }
    }

    /// Free that bypasses the thread cache: trim, drain-on-exit, and
    /// cache-rejected handles. `used` was already settled at release time.
    pub(crate) fn free_direct(&self, chunk_id: u32, handle: u64) {
        let mut inner = self.inner.lock();
        self.free_locked(&mut inner, chunk_id, handle);
    }

    fn free_locked(&self, inner: &mut ArenaInner, chunk_id: u32, handle: u64) {
        let chunk = inner.chunks[chunk_id as usize]
            .as_mut()
            .expect("free into destroyed chunk");
        match chunk.free(handle) {
            FreeOutcome::SlotFreed { became_available } => {
                if became_available {
                    let mm_idx = Geometry::mm_idx(handle);
                    let elem = chunk
                        .subpage_elem_size(mm_idx)
                        .expect("subpage alive after slot free");
                    Self::push_pool_ref(inner, elem, chunk_id, mm_idx);
                }
            }
            FreeOutcome::PageFreed => {}
        }
        self.rebalance(inner, chunk_id);
    }

    /// Move a chunk to the band matching its usage; destroy it when it
    /// falls out of q000. Returns true when the chunk was destroyed.
    fn rebalance(&self, inner: &mut ArenaInner, cid: u32) -> bool {
        let (usage, current) = {
            let chunk = inner.chunks[cid as usize].as_ref().expect("live chunk");
            if chunk.unpooled {
                return false;
            }
            (chunk.usage(), chunk.band)
        };

        let mut target = current;
        while usage >= inner.bands[target].max_usage {
            target = inner.bands[target].next.expect("q100 is unbounded");
        }
        loop {
            if usage >= inner.bands[target].min_usage {
                break;
            }
            match inner.bands[target].prev {
                Some(p) if p == target => break,
                Some(p) => target = p,
                None => {
                    self.destroy_chunk(inner, cid, current);
                    return true;
                }
            }
        }

        if target != current {
            let pos = inner.bands[current]
                .chunks
                .iter()
                .position(|&c| c == cid)
                .expect("chunk listed in its band");
            inner.bands[current].chunks.remove(pos);
            inner.bands[target].chunks.push(cid);
            inner.chunks[cid as usize].as_mut().expect("live chunk").band = target;
            log::trace!(
                "arena {}: chunk {} {} -> {} at {}%",
                self.id,
                cid,
                inner.bands[current].name,
                inner.bands[target].name,
                usage
            );
        }
        false
    }

    fn destroy_chunk(&self, inner: &mut ArenaInner, cid: u32, band: usize) {
        let pos = inner.bands[band]
            .chunks
            .iter()
            .position(|&c| c == cid)
            .expect("chunk listed in its band");
        inner.bands[band].chunks.remove(pos);
        inner.chunks[cid as usize] = None;
        inner.free_slots.push(cid);
        inner.pooled_chunks -= 1;
        self.metrics.chunks_destroyed.fetch_add(1, Ordering::Relaxed);
        log::debug!("arena {}: destroyed empty chunk {}", self.id, cid);
    }

    /// Test hook: verify every chunk sits in the band covering its usage.
    #[cfg(test)]
    pub(crate) fn check_band_invariant(&self) {
        let inner = self.inner.lock();
        for (b, band) in inner.bands.iter().enumerate() {
            for &cid in &band.chunks {
                let chunk = inner.chunks[cid as usize].as_ref().expect("live chunk");
                assert_eq!(chunk.band, b, "chunk {cid} band index out of sync");
                let usage = chunk.usage();
                assert!(
                    usage >= band.min_usage && usage < band.max_usage,
                    "chunk {cid} at {usage}% outside {} [{}, {})",
                    band.name,
                    band.min_usage,
                    band.max_usage
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pooled_chunk_count(&self) -> usize {
        self.inner.lock().pooled_chunks
    }
}

impl std::fmt::Display for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        writeln!(f, "arena {} ({} used / {} capacity):", self.id, self.used(), self.capacity())?;
        for band in &inner.bands {
            writeln!(f, "{}:", band.name)?;
            for &cid in &band.chunks {
                if let Some(chunk) = inner.chunks[cid as usize].as_ref() {
                    writeln!(
                        f,
                        "  chunk {}: {}% usage, {} bytes free",
                        cid,
                        chunk.usage(),
                        chunk.free_bytes()
                    )?;
                }
            }
        }
        writeln!(f, "tiny subpages:")?;
        for (i, pool) in inner.tiny_pools.iter().enumerate().skip(1) {
            if !pool.is_empty() {
                writeln!(f, "  {}: {} bytes, {} subpage(s)", i, i << 4, pool.len())?;
            }
        }
        writeln!(f, "small subpages:")?;
        for (i, pool) in inner.small_pools.iter().enumerate() {
            if !pool.is_empty() {
                writeln!(f, "  {}: {} bytes, {} subpage(s)", i, 512 << i, pool.len())?;
            }
        }
        Ok(())
    }
}
