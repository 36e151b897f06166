//! Allocator boundary behavior.
//!
//! Walks the size-class edges the pool allocator cares about: the 16-byte
//! tiny quantum, the 512-byte small threshold, the page boundary, and the
//! chunk boundary where requests leave the pool entirely.

use offheap::util::size;
use offheap::Allocator;

const PAGE: usize = 8192;
const CHUNK: usize = 16 * 1024 * 1024;

#[test]
fn test_boundary_sizes_all_succeed() {
    let alloc = Allocator::new(size::mb(64), 1);

    let sizes = [
        1,
        15,
        16,
        17,
        511,
        512,
        513,
        PAGE - 1,
        PAGE,
        PAGE + 1,
        CHUNK,
        CHUNK + 1,
    ];
    let mut bufs = Vec::new();
    for &req in &sizes {
        let buf = alloc
            .new_buffer(&vec![0x5au8; req])
            .unwrap_or_else(|e| panic!("allocation of {req} bytes failed: {e}"));
        assert!(
            buf.capacity() >= req,
            "buffer of {} for request of {req}",
            buf.capacity()
        );
        bufs.push(buf);
    }

    // Contents must be intact for every class.
    for (buf, &req) in bufs.iter().zip(sizes.iter()) {
        let back = buf.read().unwrap();
        assert_eq!(back.len(), req);
        assert!(back.iter().all(|&b| b == 0x5a), "{req}-byte payload torn");
    }

    drop(bufs);
    assert_eq!(alloc.used(), 0);
}

#[test]
fn test_tiny_quantum_spacing() {
    let alloc = Allocator::new(size::mb(16), 1);
    for req in 1..512 {
        let buf = alloc.allocate(req).unwrap();
        let cap = buf.capacity();
        assert!(cap >= req);
        assert_eq!(cap % 16, 0, "tiny class for {req} not quantum-spaced");
        assert!(cap - req < 16, "tiny class for {req} wastes {}", cap - req);
    }
    // Buffers were dropped each iteration; everything returned.
    assert_eq!(alloc.used(), 0);
}

#[test]
fn test_small_classes_power_of_two() {
    let alloc = Allocator::new(size::mb(16), 1);
    for req in [512, 700, 1025, 3000, 4097, 8000] {
        let buf = alloc.allocate(req).unwrap();
        assert!(buf.capacity().is_power_of_two(), "request {req}");
        assert!(buf.capacity() >= req);
        assert!(buf.capacity() < 2 * req, "request {req} rounded too far");
    }
}

#[test]
fn test_zero_length_value() {
    let alloc = Allocator::new(size::mb(16), 1);
    let buf = alloc.new_buffer(b"").unwrap();
    assert_eq!(buf.len(), 0);
    assert!(buf.is_empty());
    assert_eq!(buf.read().unwrap(), b"");
}

#[test]
fn test_many_distinct_payloads_do_not_alias() {
    let alloc = Allocator::new(size::mb(64), 1);

    // Mixed sizes across classes; every buffer keeps its own bytes.
    let bufs: Vec<_> = (0u32..200)
        .map(|i| {
            let len = 1 + (i as usize * 37) % 20_000;
            let fill = (i % 251) as u8;
            let buf = alloc.new_buffer(&vec![fill; len]).unwrap();
            (buf, fill, len)
        })
        .collect();

    for (buf, fill, len) in &bufs {
        let back = buf.read().unwrap();
        assert_eq!(back.len(), *len);
        assert!(
            back.iter().all(|b| b == fill),
            "payload with fill {fill:#x} aliased by another allocation"
        );
    }
}

#[test]
fn test_chunk_destroyed_when_drained() {
    let alloc = Allocator::new(size::mb(64), 1);

    let bufs: Vec<_> = (0..4).map(|_| alloc.allocate(size::mb(2)).unwrap()).collect();
    let created = alloc.metrics().chunks_created;
    assert!(created >= 1);

    drop(bufs);
    // 2 MiB runs bypass the thread cache, so the chunk really drains and
    // falls out of the q000 band.
    let m = alloc.metrics();
    assert_eq!(m.chunks_destroyed, created);
    assert_eq!(alloc.used(), 0);
}

#[test]
fn test_reuse_after_free_same_class() {
    let alloc = Allocator::new(size::mb(16), 1);

    for _ in 0..10_000 {
        let buf = alloc.new_buffer(&[1u8; 100]).unwrap();
        assert_eq!(buf.read().unwrap(), [1u8; 100]);
    }
    // Ten thousand cycles must not grow the pool past a single chunk.
    let m = alloc.metrics();
    assert_eq!(m.chunks_created, 1);
    assert!(m.thread_cache_hits > 0, "same-thread reuse should hit the cache");
    assert_eq!(alloc.used(), 0);
}
