//! Concurrent stress: the map and allocator under parallel mutation.
//!
//! Threads work disjoint key sets, so every thread knows exactly which of
//! its keys survive. After the run the global `size` must equal the sum of
//! surviving keys and `used` must equal the sum of live buffer capacities,
//! the two invariants that tie the map to the allocator.

mod common;

use std::sync::Arc;
use std::thread;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::{live_capacity, standard_cache};

const THREADS: usize = 4;
const OPS_PER_THREAD: usize = 10_000;
const KEYS_PER_THREAD: usize = 200;

#[test]
fn test_random_ops_disjoint_key_sets() {
    let cache = Arc::new(standard_cache());

    let survivors: Vec<usize> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    let mut rng = StdRng::seed_from_u64(0xcafe + t as u64);
                    let mut live = vec![false; KEYS_PER_THREAD];

                    for _ in 0..OPS_PER_THREAD {
                        let i = rng.gen_range(0..KEYS_PER_THREAD);
                        let key = format!("t{t}-k{i}");
                        match rng.gen_range(0..3) {
                            0 => {
                                let len = 1 + rng.gen_range(0..4096);
                                cache.set(key, &vec![t as u8; len]).unwrap();
                                live[i] = true;
                            }
                            1 => {
                                let found = cache.get(&key).is_some();
                                assert_eq!(
                                    found, live[i],
                                    "thread {t} sees wrong state for its own key {i}"
                                );
                            }
                            _ => {
                                let removed = cache.remove(&key);
                                assert_eq!(removed, live[i]);
                                live[i] = false;
                            }
                        }
                    }
                    live.iter().filter(|&&l| l).count()
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let expected: usize = survivors.iter().sum();
    assert_eq!(cache.size(), expected);
    assert_eq!(cache.used(), live_capacity(&cache));

    cache.clear();
    assert_eq!(cache.size(), 0);
    assert_eq!(cache.used(), 0);
}

#[test]
fn test_shared_keys_no_torn_reads() {
    // All threads hammer the same small key space; every read must see a
    // complete payload from some writer, never a mix.
    let cache = Arc::new(standard_cache());

    thread::scope(|scope| {
        for t in 0..THREADS {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(t as u64);
                for _ in 0..2_000 {
                    let key = format!("shared-{}", rng.gen_range(0..8));
                    if rng.gen_bool(0.5) {
                        let fill: u8 = rng.gen();
                        cache.set(key, &vec![fill; 1024]).unwrap();
                    } else if let Some(bytes) = cache.get(&key) {
                        assert_eq!(bytes.len(), 1024);
                        let first = bytes[0];
                        assert!(
                            bytes.iter().all(|&b| b == first),
                            "torn read: mixed fills in one payload"
                        );
                    }
                }
            });
        }
    });

    cache.clear();
    assert_eq!(cache.used(), 0);
}

#[test]
fn test_concurrent_size_converges() {
    let cache = Arc::new(standard_cache());
    for i in 0..100 {
        cache.set(format!("k{i}"), b"x").unwrap();
    }

    // Readers compute size while writers churn unrelated keys; the locked
    // fallback must keep every answer within the possible range.
    thread::scope(|scope| {
        for t in 0..2 {
            let cache = Arc::clone(&cache);
            scope.spawn(move || {
                for i in 0..1_000 {
                    cache.set(format!("churn-t{t}-{i}"), b"y").unwrap();
                    cache.remove(&format!("churn-t{t}-{i}"));
                }
            });
        }
        let cache = Arc::clone(&cache);
        scope.spawn(move || {
            for _ in 0..500 {
                let n = cache.size();
                assert!(
                    (100..=102).contains(&n),
                    "size {n} outside possible bounds"
                );
            }
        });
    });

    assert_eq!(cache.size(), 100);
    cache.clear();
}

#[test]
fn test_cross_thread_free_returns_memory() {
    // Values allocated on one thread, released from another: the freeing
    // thread's cache must not capture foreign handles, and used() must
    // still settle to zero.
    let cache = Arc::new(standard_cache());

    for i in 0..64 {
        cache.set(format!("k{i}"), &vec![1u8; 10_000]).unwrap();
    }

    thread::scope(|scope| {
        let cache = Arc::clone(&cache);
        scope.spawn(move || {
            for i in 0..64 {
                assert!(cache.remove(&format!("k{i}")));
            }
        });
    });

    assert_eq!(cache.size(), 0);
    assert_eq!(cache.used(), 0);
}
