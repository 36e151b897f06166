//! Sub-page splitter for small allocations.
//!
//! A subpage takes over one page of a chunk and carves it into fixed-size
//! elements, tracking free slots in a bitmap. While any slot is allocated the
//! subpage stays alive; freeing the last slot releases the backing page to
//! the chunk's buddy tree.

/// Splits one page into `page_size / elem_size` fixed-size slots.
pub(crate) struct Subpage {
    elem_size: usize,
    max_num_elems: usize,
    bitmap: Vec<u64>,
    num_avail: usize,
    next_avail: Option<usize>,
    do_not_destroy: bool,
}

impl Subpage {
    /// Create a splitter over one `page_size` page with elements of
    /// `elem_size` bytes. `elem_size` is a normalized small capacity and
    /// divides the page evenly or leaves a remainder that is simply unused.
    pub(crate) fn new(page_size: usize, elem_size: usize) -> Self {
        debug_assert!(elem_size >= 16 && elem_size <= page_size);
        let max_num_elems = page_size / elem_size;
        let words = max_num_elems.div_ceil(64);
        Self {
            elem_size,
            max_num_elems,
            bitmap: vec![0; words],
            num_avail: max_num_elems,
            next_avail: Some(0),
            do_not_destroy: true,
        }
    }

    pub(crate) fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub(crate) fn num_avail(&self) -> usize {
        self.num_avail
    }

    pub(crate) fn max_num_elems(&self) -> usize {
        self.max_num_elems
    }

    pub(crate) fn is_destroyable(&self) -> bool {
        !self.do_not_destroy
    }

    /// Take the first clear bit; `None` when every slot is taken.
    pub(crate) fn allocate(&mut self) -> Option<usize> {
        if self.num_avail == 0 {
            return None;
        }

        let idx = match self.next_avail.take() {
            Some(hint) if !self.is_set(hint) => hint,
            _ => self.find_clear_bit()?,
        };

        self.set_bit(idx);
        self.num_avail -= 1;
        Some(idx)
    }

    /// Clear `bitmap_idx`. Returns `true` while slots remain taken; `false`
    /// means the last slot was freed and the backing page can return to the
    /// buddy tree.
    pub(crate) fn free(&mut self, bitmap_idx: usize) -> bool {
        assert!(
            bitmap_idx < self.max_num_elems,
            "subpage slot {bitmap_idx} out of range (max {})",
            self.max_num_elems
        );
        assert!(
            self.is_set(bitmap_idx),
            "double free of subpage slot {bitmap_idx}"
        );

        self.clear_bit(bitmap_idx);
        self.num_avail += 1;
        self.next_avail = Some(bitmap_idx);

        if self.num_avail == self.max_num_elems {
            self.do_not_destroy = false;
            return false;
        }
        true
    }

    fn find_clear_bit(&self) -> Option<usize> {
        for (w, &word) in self.bitmap.iter().enumerate() {
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                let idx = w * 64 + bit;
                if idx < self.max_num_elems {
                    return Some(idx);
                }
            }
        }
        None
    }

    #[inline]
    fn is_set(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1u64 << (idx % 64)) != 0
    }

    #[inline]
    fn set_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1u64 << (idx % 64);
    }

    #[inline]
    fn clear_bit(&mut self, idx: usize) {
        self.bitmap[idx / 64] &= !(1u64 << (idx % 64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_all_slots() {
        let mut sub = Subpage::new(8192, 1024);
        assert_eq!(sub.max_num_elems(), 8);

        let mut seen = std::collections::HashSet::new();
        for _ in 0..8 {
            let idx = sub.allocate().expect("slot available");
            assert!(seen.insert(idx), "slot {idx} handed out twice");
        }
        assert_eq!(sub.num_avail(), 0);
        assert!(sub.allocate().is_none());
    }

    #[test]
    fn test_free_last_slot_releases_page() {
        let mut sub = Subpage::new(8192, 4096);
        let a = sub.allocate().unwrap();
        let b = sub.allocate().unwrap();

        assert!(sub.free(a), "slots remain taken");
        assert!(!sub.free(b), "last slot freed, page destroyable");
        assert!(sub.is_destroyable());
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut sub = Subpage::new(8192, 16);
        let idx = sub.allocate().unwrap();
        sub.free(idx);
        assert_eq!(sub.allocate().unwrap(), idx);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut sub = Subpage::new(8192, 16);
        let idx = sub.allocate().unwrap();
        sub.free(idx);
        sub.free(idx);
    }

    #[test]
    fn test_many_slots_bitmap_words() {
        // 8192 / 16 = 512 slots, 8 bitmap words.
        let mut sub = Subpage::new(8192, 16);
        let taken: Vec<usize> = (0..512).map(|_| sub.allocate().unwrap()).collect();
        assert_eq!(sub.num_avail(), 0);
        for idx in taken.iter().rev().skip(1) {
            assert!(sub.free(*idx));
        }
        assert!(!sub.free(taken[0]));
    }
}
