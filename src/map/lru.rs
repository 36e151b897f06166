//! Per-segment LRU list.
//!
//! An index-linked list over a slab of nodes with head and tail sentinels:
//! O(1) insert, promote and remove with no per-operation allocation beyond
//! slab growth. Each value entry carries its slot index, so the list is
//! intrusive without raw pointers.
//!
//! Insert and remove run under the segment's write lock; promote may arrive
//! under the read lock. The internal mutex is the "brief exclusive sub-lock"
//! serializing those, held strictly inside the segment lock and never across
//! any other acquisition. The observable contract is only that recently
//! accessed entries drift toward the head.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use super::value::CacheValue;

/// Sentinel slot meaning "not linked".
pub(crate) const NIL: usize = usize::MAX;

const HEAD: usize = 0;
const TAIL: usize = 1;

struct Node<K> {
    prev: usize,
    next: usize,
    value: Option<Arc<CacheValue<K>>>,
}

struct LruInner<K> {
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    len: usize,
}

pub(crate) struct Lru<K> {
    inner: Mutex<LruInner<K>>,
}

impl<K> Lru<K> {
    pub(crate) fn new() -> Self {
        let nodes = vec![
            Node {
                prev: NIL,
                next: TAIL,
                value: None,
            },
            Node {
                prev: HEAD,
                next: NIL,
                value: None,
            },
        ];
        Self {
            inner: Mutex::new(LruInner {
                nodes,
                free: Vec::new(),
                len: 0,
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len
    }

    /// Link `value` at the head (most recently used).
    pub(crate) fn insert(&self, value: &Arc<CacheValue<K>>) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(
            value.lru_slot.load(Ordering::Relaxed),
            NIL,
            "value already linked"
        );

        let slot = match inner.free.pop() {
            Some(slot) => {
                inner.nodes[slot].value = Some(Arc::clone(value));
                slot
            }
            None => {
                inner.nodes.push(Node {
                    prev: NIL,
                    next: NIL,
                    value: Some(Arc::clone(value)),
                });
                inner.nodes.len() - 1
            }
        };
        Self::link_at_head(&mut inner, slot);
        value.lru_slot.store(slot, Ordering::Relaxed);
        inner.len += 1;
    }

    /// Unlink `value`; no-op when it is not in the list.
    pub(crate) fn remove(&self, value: &Arc<CacheValue<K>>) -> bool {
        let mut inner = self.inner.lock();
        let slot = value.lru_slot.swap(NIL, Ordering::Relaxed);
        if slot == NIL {
            return false;
        }
        debug_assert!(
            inner.nodes[slot]
                .value
                .as_ref()
                .is_some_and(|v| Arc::ptr_eq(v, value)),
            "lru slot points at a different value"
        );

        Self::unlink(&mut inner, slot);
        inner.nodes[slot].value = None;
        inner.free.push(slot);
        inner.len -= 1;
        true
    }

    /// Move `value` to the head. Values not currently linked are ignored;
    /// a reader can race a removal, and the promotion simply loses.
    pub(crate) fn promote(&self, value: &Arc<CacheValue<K>>) {
        let mut inner = self.inner.lock();
        let slot = value.lru_slot.load(Ordering::Relaxed);
        if slot == NIL {
            return;
        }
        Self::unlink(&mut inner, slot);
        Self::link_at_head(&mut inner, slot);
    }

    /// The `n` least-recently-used entries, coldest first.
    pub(crate) fn tails(&self, n: usize) -> Vec<Arc<CacheValue<K>>> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(n.min(inner.len));
        let mut slot = inner.nodes[TAIL].prev;
        while slot != HEAD && out.len() < n {
            let node = &inner.nodes[slot];
            out.push(Arc::clone(node.value.as_ref().expect("linked node has value")));
            slot = node.prev;
        }
        out
    }

    /// Unlink everything, resetting each value's slot.
    pub(crate) fn clear(&self) {
        let mut inner = self.inner.lock();
        let mut slot = inner.nodes[HEAD].next;
        while slot != TAIL {
            let next = inner.nodes[slot].next;
            if let Some(value) = inner.nodes[slot].value.take() {
                value.lru_slot.store(NIL, Ordering::Relaxed);
            }
            inner.free.push(slot);
            slot = next;
        }
        inner.nodes[HEAD].next = TAIL;
        inner.nodes[TAIL].prev = HEAD;
        inner.len = 0;
    }

    fn link_at_head(inner: &mut LruInner<K>, slot: usize) {
        let first = inner.nodes[HEAD].next;
        inner.nodes[slot].prev = HEAD;
        inner.nodes[slot].next = first;
        inner.nodes[first].prev = slot;
        inner.nodes[HEAD].next = slot;
    }

    fn unlink(inner: &mut LruInner<K>, slot: usize) {
        let (prev, next) = (inner.nodes[slot].prev, inner.nodes[slot].next);
        inner.nodes[prev].next = next;
        inner.nodes[next].prev = prev;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::util::size;

    fn value(alloc: &Allocator, key: &str) -> Arc<CacheValue<String>> {
        let buf = alloc.new_buffer(key.as_bytes()).unwrap();
        Arc::new(CacheValue::new(key.to_string(), buf))
    }

    #[test]
    fn test_insert_and_tails_order() {
        let alloc = Allocator::new(size::mb(16), 1);
        let lru = Lru::new();
        let (a, b, c) = (value(&alloc, "a"), value(&alloc, "b"), value(&alloc, "c"));

        lru.insert(&a);
        lru.insert(&b);
        lru.insert(&c);
        assert_eq!(lru.len(), 3);

        // Coldest first: a was inserted first.
        let tails = lru.tails(2);
        assert_eq!(tails[0].key(), "a");
        assert_eq!(tails[1].key(), "b");
    }

    #[test]
    fn test_promote_moves_to_head() {
        let alloc = Allocator::new(size::mb(16), 1);
        let lru = Lru::new();
        let (a, b) = (value(&alloc, "a"), value(&alloc, "b"));

        lru.insert(&a);
        lru.insert(&b);
        lru.promote(&a);

        let tails = lru.tails(2);
        assert_eq!(tails[0].key(), "b", "b is now coldest");
        assert_eq!(tails[1].key(), "a");
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let alloc = Allocator::new(size::mb(16), 1);
        let lru = Lru::new();
        let (a, b) = (value(&alloc, "a"), value(&alloc, "b"));

        lru.insert(&a);
        assert!(lru.remove(&a));
        assert!(!lru.remove(&a), "second remove is a no-op");
        assert_eq!(lru.len(), 0);

        lru.insert(&b);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.tails(1)[0].key(), "b");
    }

    #[test]
    fn test_promote_after_remove_is_noop() {
        let alloc = Allocator::new(size::mb(16), 1);
        let lru = Lru::new();
        let a = value(&alloc, "a");

        lru.insert(&a);
        lru.remove(&a);
        lru.promote(&a);
        assert_eq!(lru.len(), 0);
        assert!(lru.tails(4).is_empty());
    }

    #[test]
    fn test_clear_resets_slots() {
        let alloc = Allocator::new(size::mb(16), 1);
        let lru = Lru::new();
        let a = value(&alloc, "a");

        lru.insert(&a);
        lru.clear();
        assert_eq!(lru.len(), 0);
        assert_eq!(a.lru_slot.load(Ordering::Relaxed), NIL);

        // Reusable after clear.
        lru.insert(&a);
        assert_eq!(lru.len(), 1);
    }
}
