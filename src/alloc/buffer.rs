//! Pooled buffer handed out by the allocator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{CacheError, Result};
use crate::memory::Region;

use super::arena::Arena;

/// A view over one allocation inside a chunk.
///
/// Not thread-safe for writes; values are written once before publication
/// and only read afterwards. A buffer is returned to its arena exactly once:
/// the explicit `release` path or, as a backstop, `Drop`.
pub struct ByteBuf {
    arena: Arc<Arena>,
    region: Arc<Region>,
    chunk_id: u32,
    handle: u64,
    offset: usize,
    length: usize,
    max_length: usize,
    unpooled: bool,
    released: AtomicBool,
}

impl ByteBuf {
    pub(crate) fn new_pooled(
        arena: Arc<Arena>,
        region: Arc<Region>,
        chunk_id: u32,
        handle: u64,
        offset: usize,
        max_length: usize,
    ) -> Self {
        Self {
            arena,
            region,
            chunk_id,
            handle,
            offset,
            length: 0,
            max_length,
            unpooled: false,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn new_unpooled(arena: Arc<Arena>, region: Arc<Region>, chunk_id: u32) -> Self {
        let max_length = region.capacity();
        Self {
            arena,
            region,
            chunk_id,
            handle: 0,
            offset: 0,
            length: 0,
            max_length,
            unpooled: true,
            released: AtomicBool::new(false),
        }
    }

    /// Usable capacity in bytes (at least the requested size).
    pub fn capacity(&self) -> usize {
        self.max_length
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Copy `data` into the buffer, replacing previous contents.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.is_released() {
            return Err(CacheError::BufferDisposed);
        }
        if data.len() > self.max_length {
            return Err(CacheError::CapacityExceeded {
                requested: data.len(),
                capacity: self.max_length,
            });
        }
        self.region.write(self.offset, data);
        self.length = data.len();
        Ok(())
    }

    /// Copy the written bytes out into a fresh vector.
    pub fn read(&self) -> Result<Vec<u8>> {
        if self.is_released() {
            return Err(CacheError::BufferDisposed);
        }
        let mut out = vec![0u8; self.length];
        self.region.read(self.offset, &mut out);
        Ok(out)
    }

    /// Copy the written bytes into `buf`, returning the number copied.
    /// `buf` must hold at least `len()` bytes.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_released() {
            return Err(CacheError::BufferDisposed);
        }
        if buf.len() < self.length {
            return Err(CacheError::CapacityExceeded {
                requested: self.length,
                capacity: buf.len(),
            });
        }
        self.region.read(self.offset, &mut buf[..self.length]);
        Ok(self.length)
    }

    /// Return the allocation to its arena. Idempotent through the CAS so the
    /// one-release invariant holds even with the `Drop` backstop.
    pub(crate) fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug_assert!(false, "buffer released twice");
            return;
        }
        self.arena.free_buf(
            self.chunk_id,
            self.handle,
            self.max_length,
            self.unpooled,
            &self.region,
        );
    }
}

impl Drop for ByteBuf {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            self.release();
        }
    }
}

impl std::fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteBuf")
            .field("chunk_id", &self.chunk_id)
            .field("handle", &format_args!("{:#x}", self.handle))
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("max_length", &self.max_length)
            .field("unpooled", &self.unpooled)
            .field("released", &self.is_released())
            .finish()
    }
}
