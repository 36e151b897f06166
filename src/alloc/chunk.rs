//! Chunk: one contiguous native region managed as a buddy tree over pages.
//!
//! The tree is a complete binary tree of `max_order + 1` levels stored as a
//! flat depth array (`memory_map`). Entry `i` holds the depth of the
//! shallowest fully-free node in `i`'s subtree:
//!
//! - `memory_map[i] == depth(i)`: the subtree is completely free
//! - `depth(i) < memory_map[i] <= max_order`: partially allocated, a run of
//!   `chunk_size >> memory_map[i]` bytes is still available below
//! - `memory_map[i] == max_order + 1`: fully allocated
//!
//! After every operation `memory_map[i] == min(memory_map[2i],
//! memory_map[2i+1])` for all internal nodes.
//!
//! Allocations smaller than a page go through a [`Subpage`] installed at a
//! leaf; the returned 64-bit handle encodes which.

use std::sync::Arc;

use crate::memory::Region;

use super::subpage::Subpage;

/// Bit 62 marks a subpage handle so bitmap index 0 is distinguishable from a
/// plain run handle.
const SUBPAGE_FLAG: u64 = 0x4000_0000_0000_0000;
const BITMAP_IDX_MASK: u64 = 0x3FFF_FFFF;

/// Fixed chunk geometry shared by every pooled chunk of an allocator.
///
/// Handle decoding lives here so a thread-local cache can rebuild a buffer
/// view from `(handle, elem_size)` without touching any lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub page_size: usize,
    pub page_shifts: u32,
    pub max_order: u32,
    pub chunk_size: usize,
}

impl Geometry {
    pub(crate) fn new(page_size: usize, max_order: u32) -> Self {
        debug_assert!(page_size.is_power_of_two());
        Self {
            page_size,
            page_shifts: page_size.trailing_zeros(),
            max_order,
            chunk_size: page_size << max_order,
        }
    }

    #[inline]
    pub(crate) fn mm_idx(handle: u64) -> usize {
        (handle & 0xFFFF_FFFF) as usize
    }

    #[inline]
    pub(crate) fn is_subpage_handle(handle: u64) -> bool {
        handle & SUBPAGE_FLAG != 0
    }

    #[inline]
    pub(crate) fn bitmap_idx(handle: u64) -> usize {
        ((handle >> 32) & BITMAP_IDX_MASK) as usize
    }

    #[inline]
    pub(crate) fn subpage_handle(mm_idx: usize, bitmap_idx: usize) -> u64 {
        SUBPAGE_FLAG | ((bitmap_idx as u64) << 32) | mm_idx as u64
    }

    #[inline]
    fn depth(id: usize) -> u32 {
        debug_assert!(id > 0);
        id.ilog2()
    }

    /// Bytes covered by the run rooted at tree node `id`.
    #[inline]
    pub(crate) fn run_length(&self, id: usize) -> usize {
        self.chunk_size >> Self::depth(id)
    }

    /// Byte offset of the run rooted at tree node `id`.
    #[inline]
    pub(crate) fn run_offset(&self, id: usize) -> usize {
        let depth = Self::depth(id);
        (id ^ (1 << depth)) * (self.chunk_size >> depth)
    }

    /// Byte offset of the allocation behind `handle`. For subpage handles
    /// `elem_size` is the slot size of the owning subpage.
    pub(crate) fn offset_of(&self, handle: u64, elem_size: usize) -> usize {
        let id = Self::mm_idx(handle);
        if Self::is_subpage_handle(handle) {
            self.run_offset(id) + Self::bitmap_idx(handle) * elem_size
        } else {
            self.run_offset(id)
        }
    }

    /// Usable bytes behind `handle`.
    pub(crate) fn max_length_of(&self, handle: u64, elem_size: usize) -> usize {
        if Self::is_subpage_handle(handle) {
            elem_size
        } else {
            self.run_length(Self::mm_idx(handle))
        }
    }
}

/// Outcome of [`Chunk::free`], used by the arena to maintain its size-class
/// pools.
pub(crate) enum FreeOutcome {
    /// A run (or the last slot of a subpage, hence its page) returned to the
    /// buddy tree.
    PageFreed,
    /// A subpage slot was freed; the subpage lives on. `became_available` is
    /// true when the subpage transitioned full -> not-full.
    SlotFreed { became_available: bool },
}

/// One `chunk_size`-byte native region plus its buddy-tree bookkeeping.
///
/// All tree state is guarded by the owning arena's lock; the chunk itself
/// holds no synchronization. An unpooled chunk carries exactly one
/// allocation equal to its capacity and bypasses the tree entirely.
pub(crate) struct Chunk {
    pub(crate) region: Arc<Region>,
    pub(crate) unpooled: bool,
    geom: Geometry,
    unusable: u8,
    /// Depth array of `2 * 2^max_order` entries; index 0 unused.
    memory_map: Vec<u8>,
    /// One optional splitter per leaf page.
    subpages: Vec<Option<Subpage>>,
    free_bytes: usize,
    /// Index of the utilization band currently holding this chunk.
    pub(crate) band: usize,
}

impl Chunk {
    pub(crate) fn new(region: Arc<Region>, geom: Geometry) -> Self {
        debug_assert_eq!(region.capacity(), geom.chunk_size);
        let max_subpage_allocs = 1usize << geom.max_order;
        let mut memory_map = vec![0u8; max_subpage_allocs * 2];
        for id in 1..memory_map.len() {
            memory_map[id] = Geometry::depth(id) as u8;
        }

        Self {
            region,
            unpooled: false,
            geom,
            unusable: (geom.max_order + 1) as u8,
            memory_map,
            subpages: (0..max_subpage_allocs).map(|_| None).collect(),
            free_bytes: geom.chunk_size,
            band: 0,
        }
    }

    /// A chunk sized exactly to one huge allocation. No tree, no bands.
    pub(crate) fn new_unpooled(region: Arc<Region>) -> Self {
        let capacity = region.capacity();
        Self {
            region,
            unpooled: true,
            geom: Geometry {
                page_size: 0,
                page_shifts: 0,
                max_order: 0,
                chunk_size: capacity,
            },
            unusable: 0,
            memory_map: Vec::new(),
            subpages: Vec::new(),
            free_bytes: 0,
            band: 0,
        }
    }

    /// Percentage of the chunk currently allocated, in O(1).
    pub(crate) fn usage(&self) -> i32 {
        if self.unpooled {
            return 100;
        }
        if self.free_bytes == 0 {
            return 100;
        }
        let free_pct = (self.free_bytes as u64 * 100 / self.geom.chunk_size as u64) as i32;
        if free_pct == 0 {
            99
        } else {
            100 - free_pct
        }
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Allocate a normalized capacity. Page-multiple requests take a run from
    /// the tree; smaller requests install (or should have hit) a subpage.
    pub(crate) fn allocate(&mut self, norm_capacity: usize) -> Option<u64> {
        debug_assert!(!self.unpooled);
        if norm_capacity & !(self.geom.page_size - 1) != 0 {
            self.allocate_run(norm_capacity)
        } else {
            self.allocate_subpage(norm_capacity)
        }
    }

    fn allocate_run(&mut self, norm_capacity: usize) -> Option<u64> {
        debug_assert!(norm_capacity.is_power_of_two());
        let d = self.geom.max_order - (norm_capacity.trailing_zeros() - self.geom.page_shifts);
        let id = self.allocate_node(d)?;
        self.free_bytes -= self.geom.run_length(id);
        Some(id as u64)
    }

    /// Take one page, install a fresh subpage splitter at its leaf and
    /// allocate slot 0 from it.
    fn allocate_subpage(&mut self, elem_size: usize) -> Option<u64> {
        let id = self.allocate_node(self.geom.max_order)?;
        self.free_bytes -= self.geom.page_size;

        let mut subpage = Subpage::new(self.geom.page_size, elem_size);
        let bitmap_idx = subpage
            .allocate()
            .expect("fresh subpage must have a free slot");

        let leaf = self.leaf_idx(id);
        debug_assert!(self.subpages[leaf].is_none(), "leaf {leaf} already split");
        self.subpages[leaf] = Some(subpage);

        Some(Geometry::subpage_handle(id, bitmap_idx))
    }

    /// Allocate another slot from the live subpage at tree node `mm_idx`.
    /// Used on size-class pool hits.
    pub(crate) fn allocate_in_subpage(&mut self, mm_idx: usize) -> Option<u64> {
        let leaf = self.leaf_idx(mm_idx);
        let subpage = self.subpages[leaf].as_mut()?;
        let bitmap_idx = subpage.allocate()?;
        Some(Geometry::subpage_handle(mm_idx, bitmap_idx))
    }

    /// Slot size of the subpage at `mm_idx`, if one is installed.
    pub(crate) fn subpage_elem_size(&self, mm_idx: usize) -> Option<usize> {
        let leaf = self.leaf_idx(mm_idx);
        self.subpages[leaf].as_ref().map(|s| s.elem_size())
    }

    /// Whether the subpage at `mm_idx` still has free slots.
    pub(crate) fn subpage_has_avail(&self, mm_idx: usize) -> bool {
        let leaf = self.leaf_idx(mm_idx);
        self.subpages[leaf]
            .as_ref()
            .map(|s| s.num_avail() > 0)
            .unwrap_or(false)
    }

    /// Return an allocation to the chunk.
    pub(crate) fn free(&mut self, handle: u64) -> FreeOutcome {
        debug_assert!(!self.unpooled);
        let id = Geometry::mm_idx(handle);

        if Geometry::is_subpage_handle(handle) {
            let leaf = self.leaf_idx(id);
            let subpage = self.subpages[leaf]
                .as_mut()
                .unwrap_or_else(|| panic!("invalid handle {handle:#x}: no subpage at leaf {leaf}"));
            let was_full = subpage.num_avail() == 0;
            if subpage.free(Geometry::bitmap_idx(handle)) {
                return FreeOutcome::SlotFreed {
                    became_available: was_full,
                };
            }
            // Last slot freed: the splitter goes away and the page itself
            // returns to the tree below.
            self.subpages[leaf] = None;
        }

        assert_eq!(
            self.memory_map[id], self.unusable,
            "double free of run handle {handle:#x}"
        );
        self.free_bytes += self.geom.run_length(id);
        self.memory_map[id] = Geometry::depth(id) as u8;
        self.update_parents_free(id);
        FreeOutcome::PageFreed
    }

    /// Descend from the root to depth `d`, at each node taking the left
    /// child when its stored depth qualifies, otherwise the right.
    fn allocate_node(&mut self, d: u32) -> Option<usize> {
        if self.memory_map[1] > d as u8 {
            return None;
        }

        let mut id = 1usize;
        for _ in 0..d {
            id <<= 1;
            if self.memory_map[id] > d as u8 {
                id ^= 1;
            }
        }
        debug_assert_eq!(
            self.memory_map[id], d as u8,
            "descent must land on a fully free node"
        );

        self.memory_map[id] = self.unusable;
        self.update_parents_alloc(id);
        Some(id)
    }

    fn update_parents_alloc(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            self.memory_map[parent] = self.memory_map[id].min(self.memory_map[id ^ 1]);
            id = parent;
        }
    }

    /// Restore ancestors after a free: collapse buddies back into their
    /// parent while both siblings sit at their natural depth.
    fn update_parents_free(&mut self, mut id: usize) {
        while id > 1 {
            let parent = id >> 1;
            let natural_child = (Geometry::depth(parent) + 1) as u8;
            let v1 = self.memory_map[id];
            let v2 = self.memory_map[id ^ 1];
            self.memory_map[parent] = if v1 == natural_child && v2 == natural_child {
                natural_child - 1
            } else {
                v1.min(v2)
            };
            id = parent;
        }
    }

    #[inline]
    fn leaf_idx(&self, mm_idx: usize) -> usize {
        debug_assert!(Geometry::depth(mm_idx) == self.geom.max_order);
        mm_idx ^ (1 << self.geom.max_order)
    }

    /// Verify the min-propagation invariant over the whole tree. Test hook.
    #[cfg(test)]
    pub(crate) fn check_tree_invariant(&self) {
        let leaves = 1usize << self.geom.max_order;
        for id in 1..leaves {
            let expect = self.memory_map[2 * id].min(self.memory_map[2 * id + 1]);
            assert_eq!(
                self.memory_map[id], expect,
                "memory_map[{id}] violates min invariant"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunk() -> Chunk {
        // 8 KiB pages, 4 levels -> 128 KiB chunk. Small enough to exhaust.
        let geom = Geometry::new(8192, 4);
        let region = Arc::new(Region::new(geom.chunk_size).unwrap());
        Chunk::new(region, geom)
    }

    #[test]
    fn test_run_allocation_exhausts_chunk() {
        let mut chunk = small_chunk();
        let total_pages = 16;

        let handles: Vec<u64> = (0..total_pages)
            .map(|_| chunk.allocate(8192).expect("page available"))
            .collect();
        assert_eq!(chunk.free_bytes(), 0);
        assert_eq!(chunk.usage(), 100);
        assert!(chunk.allocate(8192).is_none());
        chunk.check_tree_invariant();

        for h in handles {
            chunk.free(h);
        }
        assert_eq!(chunk.free_bytes(), 128 * 1024);
        chunk.check_tree_invariant();
    }

    #[test]
    fn test_buddy_collapse_allows_large_run() {
        let mut chunk = small_chunk();

        // Fill with pages, free them all, then the full chunk must be
        // allocatable as a single run again.
        let handles: Vec<u64> = (0..16).map(|_| chunk.allocate(8192).unwrap()).collect();
        for h in handles {
            chunk.free(h);
        }

        let whole = chunk.allocate(128 * 1024).expect("tree collapsed");
        assert_eq!(Geometry::mm_idx(whole), 1);
        chunk.free(whole);
        chunk.check_tree_invariant();
    }

    #[test]
    fn test_distinct_runs_do_not_overlap() {
        let mut chunk = small_chunk();
        let geom = Geometry::new(8192, 4);

        let a = chunk.allocate(16 * 1024).unwrap();
        let b = chunk.allocate(32 * 1024).unwrap();
        let c = chunk.allocate(8192).unwrap();

        let ranges = [
            (geom.offset_of(a, 0), 16 * 1024),
            (geom.offset_of(b, 0), 32 * 1024),
            (geom.offset_of(c, 0), 8192),
        ];
        for (i, &(off_a, len_a)) in ranges.iter().enumerate() {
            for &(off_b, len_b) in ranges.iter().skip(i + 1) {
                assert!(
                    off_a + len_a <= off_b || off_b + len_b <= off_a,
                    "runs overlap: [{off_a}, +{len_a}) vs [{off_b}, +{len_b})"
                );
            }
        }
        chunk.check_tree_invariant();
    }

    #[test]
    fn test_subpage_allocation_and_refill() {
        let mut chunk = small_chunk();

        let h0 = chunk.allocate(1024).expect("installs subpage");
        assert!(Geometry::is_subpage_handle(h0));
        let mm_idx = Geometry::mm_idx(h0);
        assert_eq!(chunk.subpage_elem_size(mm_idx), Some(1024));

        // Page holds 8 slots; 7 more from the same subpage.
        let rest: Vec<u64> = (0..7)
            .map(|_| chunk.allocate_in_subpage(mm_idx).expect("slot"))
            .collect();
        assert!(!chunk.subpage_has_avail(mm_idx));
        assert!(chunk.allocate_in_subpage(mm_idx).is_none());

        // Freeing one slot reopens the subpage.
        match chunk.free(rest[0]) {
            FreeOutcome::SlotFreed { became_available } => assert!(became_available),
            _ => panic!("expected slot free"),
        }
        assert!(chunk.subpage_has_avail(mm_idx));

        // Free everything; the final free releases the page.
        for h in rest.iter().skip(1) {
            chunk.free(*h);
        }
        match chunk.free(h0) {
            FreeOutcome::PageFreed => {}
            _ => panic!("last slot must free the page"),
        }
        assert_eq!(chunk.free_bytes(), 128 * 1024);
        chunk.check_tree_invariant();
    }

    #[test]
    fn test_subpage_offsets_are_disjoint() {
        let mut chunk = small_chunk();
        let geom = Geometry::new(8192, 4);

        let first = chunk.allocate(2048).unwrap();
        let mm_idx = Geometry::mm_idx(first);
        let mut offsets = vec![geom.offset_of(first, 2048)];
        while let Some(h) = chunk.allocate_in_subpage(mm_idx) {
            offsets.push(geom.offset_of(h, 2048));
        }

        offsets.sort_unstable();
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= 2048, "slots overlap: {pair:?}");
        }
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_run_panics() {
        let mut chunk = small_chunk();
        let h = chunk.allocate(8192).unwrap();
        chunk.free(h);
        chunk.free(h);
    }

    #[test]
    fn test_usage_bands_values() {
        let mut chunk = small_chunk();
        assert_eq!(chunk.usage(), 0);

        let h = chunk.allocate(64 * 1024).unwrap();
        assert_eq!(chunk.usage(), 50);
        chunk.free(h);
        assert_eq!(chunk.usage(), 0);
    }

    #[test]
    fn test_tree_invariant_under_random_churn() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut chunk = small_chunk();
        let mut rng = StdRng::seed_from_u64(7);
        let mut live: Vec<u64> = Vec::new();

        for round in 0..2_000 {
            if live.is_empty() || (rng.gen_bool(0.55) && live.len() < 64) {
                // Sizes spanning subpage and run classes.
                let norm = match rng.gen_range(0..4) {
                    0 => 16 * (1 + rng.gen_range(0..31)),
                    1 => 512 << rng.gen_range(0..4),
                    2 => 8192,
                    _ => 8192 << rng.gen_range(1..4),
                };
                if let Some(h) = chunk.allocate(norm) {
                    live.push(h);
                }
            } else {
                let h = live.swap_remove(rng.gen_range(0..live.len()));
                chunk.free(h);
            }

            if round % 64 == 0 {
                chunk.check_tree_invariant();
            }
        }

        for h in live {
            chunk.free(h);
        }
        chunk.check_tree_invariant();
        assert_eq!(chunk.free_bytes(), 128 * 1024);
    }

    #[test]
    fn test_handle_encoding_round_trip() {
        let h = Geometry::subpage_handle(2048, 37);
        assert!(Geometry::is_subpage_handle(h));
        assert_eq!(Geometry::mm_idx(h), 2048);
        assert_eq!(Geometry::bitmap_idx(h), 37);

        let run = 1027u64;
        assert!(!Geometry::is_subpage_handle(run));
        assert_eq!(Geometry::mm_idx(run), 1027);
    }
}
