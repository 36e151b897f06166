//! Raw native memory region.
//!
//! A `Region` owns one contiguous anonymous mapping and exposes byte-level
//! read/write at offsets. Values stored in a region are invisible to the
//! host allocator and garbage-free by construction; the mapping is returned
//! to the OS when the region drops.
//!
//! Integer accessors use native byte order through unaligned loads/stores,
//! so callers never need to align their payload layouts to the region.

use crate::error::{CacheError, Result};
use memmap2::MmapMut;

/// Bulk copies above this threshold are split into repeated moves.
/// Large single copies can stall signal delivery on some platforms.
const COPY_CHUNK: usize = 1024 * 1024;

/// One contiguous native region of `(base, capacity)`.
///
/// Exclusively owned by whoever allocated it. Concurrent access to disjoint
/// offset ranges is the caller's contract; the pool allocator above never
/// hands the same range to two owners.
pub struct Region {
    mmap: MmapMut,
    capacity: usize,
}

impl Region {
    /// Map a new zero-filled anonymous region of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let mmap = MmapMut::map_anon(capacity.max(1))
            .map_err(|e| CacheError::Memory(format!("anonymous mapping failed: {e}")))?;
        Ok(Self { mmap, capacity })
    }

    /// Base address of the region.
    pub fn base(&self) -> usize {
        self.mmap.as_ptr() as usize
    }

    /// Capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn ptr(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset <= self.capacity, "offset {offset} out of region");
        // The mapping is writable for its whole lifetime; &self suffices
        // because range ownership is enforced by the allocator above.
        unsafe { (self.mmap.as_ptr() as *mut u8).add(offset) }
    }

    /// Copy `data` into the region at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) {
        debug_assert!(
            offset + data.len() <= self.capacity,
            "write out of bounds: offset={offset}, len={}, capacity={}",
            data.len(),
            self.capacity
        );
        let mut written = 0;
        while written < data.len() {
            let n = (data.len() - written).min(COPY_CHUNK);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(written),
                    self.ptr(offset + written),
                    n,
                );
            }
            written += n;
        }
    }

    /// Copy `buf.len()` bytes out of the region at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        debug_assert!(
            offset + buf.len() <= self.capacity,
            "read out of bounds: offset={offset}, len={}, capacity={}",
            buf.len(),
            self.capacity
        );
        let mut read = 0;
        while read < buf.len() {
            let n = (buf.len() - read).min(COPY_CHUNK);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.ptr(offset + read),
                    buf.as_mut_ptr().add(read),
                    n,
                );
            }
            read += n;
        }
    }

    /// Copy `len` bytes from `src` at `src_offset` into this region.
    pub fn copy_from(&self, src: &Region, src_offset: usize, dst_offset: usize, len: usize) {
        debug_assert!(src_offset + len <= src.capacity);
        debug_assert!(dst_offset + len <= self.capacity);
        let mut moved = 0;
        while moved < len {
            let n = (len - moved).min(COPY_CHUNK);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.ptr(src_offset + moved),
                    self.ptr(dst_offset + moved),
                    n,
                );
            }
            moved += n;
        }
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        debug_assert!(offset < self.capacity);
        unsafe { *self.ptr(offset) }
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        debug_assert!(offset < self.capacity);
        unsafe { *self.ptr(offset) = value }
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        debug_assert!(offset + 2 <= self.capacity);
        unsafe { std::ptr::read_unaligned(self.ptr(offset) as *const u16) }
    }

    pub fn put_u16(&self, offset: usize, value: u16) {
        debug_assert!(offset + 2 <= self.capacity);
        unsafe { std::ptr::write_unaligned(self.ptr(offset) as *mut u16, value) }
    }

    pub fn get_u32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= self.capacity);
        unsafe { std::ptr::read_unaligned(self.ptr(offset) as *const u32) }
    }

    pub fn put_u32(&self, offset: usize, value: u32) {
        debug_assert!(offset + 4 <= self.capacity);
        unsafe { std::ptr::write_unaligned(self.ptr(offset) as *mut u32, value) }
    }

    pub fn get_u64(&self, offset: usize) -> u64 {
        debug_assert!(offset + 8 <= self.capacity);
        unsafe { std::ptr::read_unaligned(self.ptr(offset) as *const u64) }
    }

    pub fn put_u64(&self, offset: usize, value: u64) {
        debug_assert!(offset + 8 <= self.capacity);
        unsafe { std::ptr::write_unaligned(self.ptr(offset) as *mut u64, value) }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("base", &format_args!("{:#x}", self.base()))
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_round_trip() {
        let region = Region::new(4096).unwrap();
        let data = b"value123";
        region.write(100, data);

        let mut buf = [0u8; 8];
        region.read(100, &mut buf);
        assert_eq!(&buf, data);
    }

    #[test]
    fn test_region_zero_filled() {
        let region = Region::new(64).unwrap();
        let mut buf = [0xffu8; 64];
        region.read(0, &mut buf);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_integer_accessors() {
        let region = Region::new(64).unwrap();

        region.put_u8(0, 0xab);
        assert_eq!(region.get_u8(0), 0xab);

        region.put_u16(1, 0xbeef);
        assert_eq!(region.get_u16(1), 0xbeef);

        // Deliberately unaligned offsets.
        region.put_u32(3, 0xdead_beef);
        assert_eq!(region.get_u32(3), 0xdead_beef);

        region.put_u64(9, 0x0123_4567_89ab_cdef);
        assert_eq!(region.get_u64(9), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn test_copy_between_regions() {
        let a = Region::new(1024).unwrap();
        let b = Region::new(1024).unwrap();
        a.write(0, &[7u8; 512]);

        b.copy_from(&a, 0, 256, 512);

        let mut buf = [0u8; 512];
        b.read(256, &mut buf);
        assert!(buf.iter().all(|&x| x == 7));
    }

    #[test]
    fn test_large_copy_split() {
        // Crosses the split threshold; contents must survive the chunked path.
        let len = 3 * COPY_CHUNK + 17;
        let region = Region::new(len).unwrap();
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        region.write(0, &data);

        let mut back = vec![0u8; len];
        region.read(0, &mut back);
        assert_eq!(back, data);
    }
}
