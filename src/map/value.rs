//! Reference-counted value entry.
//!
//! A value entry ties an allocator buffer to a map key. The hash table holds
//! one reference; the LRU list is intrusive and holds none. Readers that
//! escape the segment lock with an entry retain it first and release when
//! done; [`ValueRef`] does both.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alloc::ByteBuf;
use crate::error::Result;

use super::lru::NIL;

/// One cached value: key, off-heap buffer, bookkeeping.
pub struct CacheValue<K> {
    key: K,
    buf: ByteBuf,
    hits: AtomicU64,
    create_time: Instant,
    ttl: Option<Duration>,
    /// Starts at 1 for the hash-table reference. The buffer returns to its
    /// arena exactly when this reaches zero.
    ref_count: AtomicU32,
    /// Slot index in the owning segment's LRU list; `NIL` while unlinked.
    /// Only touched under the LRU lock.
    pub(crate) lru_slot: AtomicUsize,
}

impl<K> CacheValue<K> {
    pub fn new(key: K, buf: ByteBuf) -> Self {
        Self::with_ttl(key, buf, None)
    }

    pub fn with_ttl(key: K, buf: ByteBuf, ttl: Option<Duration>) -> Self {
        Self {
            key,
            buf,
            hits: AtomicU64::new(0),
            create_time: Instant::now(),
            ttl,
            ref_count: AtomicU32::new(1),
            lru_slot: AtomicUsize::new(NIL),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Capacity of the backing buffer (>= `len`).
    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn age(&self) -> Duration {
        self.create_time.elapsed()
    }

    pub fn expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.create_time.elapsed() >= ttl,
            None => false,
        }
    }

    /// Copy the payload out of native memory.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.buf.read()
    }

    pub fn is_disposed(&self) -> bool {
        self.buf.is_released()
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take an additional reference. Must only be called while the current
    /// count is known to be > 0 (i.e. under the segment lock, or through an
    /// already-held reference).
    pub(crate) fn retain(&self) {
        let prev = self.ref_count.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain on a dead value");
    }

    /// Drop one reference; the last one returns the buffer to its arena.
    pub(crate) fn release(&self) {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "value reference count underflow");
        if prev == 1 {
            self.buf.release();
        }
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for CacheValue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheValue")
            .field("key", &self.key)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("hits", &self.hits())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// A retained reference to a cache value, released on drop.
///
/// Produced by map reads: the segment retains under its read lock, the guard
/// guarantees the matching release once the caller is done with the bytes.
pub struct ValueRef<K> {
    value: Arc<CacheValue<K>>,
}

impl<K> ValueRef<K> {
    /// Wrap a value that has already been retained on the caller's behalf.
    pub(crate) fn from_retained(value: Arc<CacheValue<K>>) -> Self {
        Self { value }
    }

    pub fn entry(&self) -> &Arc<CacheValue<K>> {
        &self.value
    }
}

impl<K> Deref for ValueRef<K> {
    type Target = CacheValue<K>;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<K> Drop for ValueRef<K> {
    fn drop(&mut self) {
        self.value.release();
    }
}

impl<K: std::fmt::Debug> std::fmt::Debug for ValueRef<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use crate::util::size;

    fn new_value(alloc: &Allocator, data: &[u8]) -> CacheValue<String> {
        let buf = alloc.new_buffer(data).unwrap();
        CacheValue::new("k".to_string(), buf)
    }

    #[test]
    fn test_release_at_zero_returns_buffer() {
        let alloc = Allocator::new(size::mb(16), 1);
        let value = new_value(&alloc, b"payload");
        assert_eq!(value.ref_count(), 1);
        assert_eq!(alloc.used(), 16);

        value.retain();
        value.release();
        assert!(!value.is_disposed(), "still one reference");

        value.release();
        assert!(value.is_disposed());
        assert_eq!(alloc.used(), 0);
        assert!(matches!(
            value.read_bytes(),
            Err(crate::error::CacheError::BufferDisposed)
        ));
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_release_below_zero_panics() {
        let alloc = Allocator::new(size::mb(16), 1);
        let value = new_value(&alloc, b"x");
        value.release();
        value.release();
    }

    #[test]
    fn test_expiry() {
        let alloc = Allocator::new(size::mb(16), 1);
        let buf = alloc.new_buffer(b"x").unwrap();
        let value =
            CacheValue::with_ttl("k".to_string(), buf, Some(std::time::Duration::ZERO));
        assert!(value.expired());

        let eternal = new_value(&alloc, b"y");
        assert!(!eternal.expired());
    }

    #[test]
    fn test_hits_accumulate() {
        let alloc = Allocator::new(size::mb(16), 1);
        let value = new_value(&alloc, b"x");
        assert_eq!(value.hits(), 0);
        value.touch();
        value.touch();
        assert_eq!(value.hits(), 2);
    }
}
