//! Concurrency stress tests
//!
//! Every test drives the concurrent flavors from many threads and then
//! checks the quiescent state: no live blocks, no block handed to two
//! threads at once, counters back at zero.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use rand::seq::SliceRandom;
use region_alloc::{
    BlockPool, ChainedPool, ConcurrentBlockPool, ConcurrentChainedPool, ConcurrentStackRegion,
    DualStackRegion, StackRegion,
};
use rustc_hash::FxHashSet;
use test_utils::{assert_disjoint, init_test_logging, sleep_jitter};

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn thread_safe_surface() {
    assert_send::<BlockPool<u64>>();
    assert_send::<ConcurrentBlockPool<u64>>();
    assert_sync::<ConcurrentBlockPool<u64>>();
    assert_send::<ChainedPool<u64>>();
    assert_send::<ConcurrentChainedPool<u64>>();
    assert_sync::<ConcurrentChainedPool<u64>>();
    assert_send::<StackRegion>();
    assert_send::<ConcurrentStackRegion>();
    assert_sync::<ConcurrentStackRegion>();
    assert_sync::<DualStackRegion<region_alloc::MultiThread>>();
}

/// A pointer value detached from its provenance so it can cross the ledger.
fn address_of(block: NonNull<u64>) -> usize {
    block.as_ptr() as usize
}

#[test]
fn chained_pool_stress_with_double_return_ledger() -> anyhow::Result<()> {
    init_test_logging();

    const THREADS: usize = 8;
    const ITERATIONS: usize = 10_000;

    let pool = Arc::new(ConcurrentChainedPool::<u64>::new(64, 16)?);
    let ledger = Arc::new(Mutex::new(FxHashSet::<usize>::default()));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|thread_id| {
            let pool = Arc::clone(&pool);
            let ledger = Arc::clone(&ledger);
            let barrier = Arc::clone(&barrier);

            thread::spawn(move || {
                barrier.wait();
                let mut failures = 0usize;

                for i in 0..ITERATIONS {
                    let Some(block) = pool.create((thread_id * ITERATIONS + i) as u64) else {
                        failures += 1;
                        thread::yield_now();
                        continue;
                    };

                    {
                        let mut live = ledger.lock().unwrap();
                        assert!(
                            live.insert(address_of(block)),
                            "block handed to two threads at once"
                        );
                    }

                    if i % 32 == 0 {
                        sleep_jitter(2);
                    }

                    {
                        let mut live = ledger.lock().unwrap();
                        assert!(live.remove(&address_of(block)));
                    }
                    assert!(unsafe { pool.destroy(block) });
                }

                failures
            })
        })
        .collect();

    let mut total_failures = 0;
    for handle in handles {
        total_failures += handle.join().expect("stress thread panicked");
    }

    // 8 threads * 1 block each can never exceed 64 * 16 blocks.
    assert_eq!(total_failures, 0, "pool reported exhaustion under its cap");
    assert!(ledger.lock().unwrap().is_empty());

    let stats = pool.stats();
    assert_eq!(stats.live_blocks, 0);
    assert!(stats.active_chunks + stats.reserved_chunks <= 16);
    Ok(())
}

#[test]
fn block_pool_rapid_recycle() {
    init_test_logging();

    // A tiny pool maximises head contention and ABA hand-overs.
    let pool = Arc::new(ConcurrentBlockPool::<u64>::new(2).unwrap());
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..5_000 {
                    if let Some(block) = pool.create(thread_id * 5_000 + i) {
                        assert!(unsafe { pool.destroy(block) });
                    }
                    if i % 10 == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.in_use(), 0);
    assert!(!pool.full());
}

#[test]
fn block_pool_payloads_do_not_tear() {
    init_test_logging();

    // Each thread stamps its blocks with a signature and verifies it after
    // jitter; a block visible to two owners would fail the check.
    let pool = Arc::new(ConcurrentBlockPool::<[u64; 4]>::new(16).unwrap());
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8u64)
        .map(|thread_id| {
            let pool = Arc::clone(&pool);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..2_000 {
                    let signature = thread_id << 32 | i;
                    let Some(block) = pool.create([signature; 4]) else {
                        thread::yield_now();
                        continue;
                    };
                    sleep_jitter(1);
                    assert_eq!(unsafe { *block.as_ref() }, [signature; 4]);
                    assert!(unsafe { pool.destroy(block) });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.in_use(), 0);
}

#[test]
fn chained_pool_staggered_release_round_trip() -> anyhow::Result<()> {
    init_test_logging();

    let pool = ConcurrentChainedPool::<u64>::new(16, 8)?;
    let initial_memory = pool.used_memory();

    let mut blocks: Vec<_> = (0..100).map(|i| pool.create(i).unwrap()).collect();
    blocks.shuffle(&mut rand::thread_rng());
    for block in blocks {
        assert!(unsafe { pool.release(block) });
    }

    assert_eq!(pool.used_memory(), initial_memory);
    assert_eq!(pool.stats().live_blocks, 0);
    Ok(())
}

#[test]
fn concurrent_stack_hands_out_disjoint_ranges() {
    init_test_logging();

    let region = Arc::new(ConcurrentStackRegion::new(256 * 1024).unwrap());
    let ranges = Arc::new(Mutex::new(Vec::new()));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8usize)
        .map(|thread_id| {
            let region = Arc::clone(&region);
            let ranges = Arc::clone(&ranges);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut claimed = Vec::new();
                for i in 0..200 {
                    let bytes = 16 + (thread_id * 7 + i) % 48;
                    if let Some(block) = region.allocate(bytes) {
                        // Touch the whole range to catch overlap corruption.
                        unsafe { block.as_ptr().write_bytes(thread_id as u8, bytes) };
                        claimed.push((block.as_ptr() as usize, bytes));
                    }
                }
                ranges.lock().unwrap().extend(claimed);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let ranges = ranges.lock().unwrap();
    assert!(!ranges.is_empty());
    assert_disjoint(&ranges);
}

#[test]
fn live_counter_matches_unreleased_blocks() {
    init_test_logging();

    // Threads keep a tail of blocks live; the final count must equal what
    // was never released.
    let pool = Arc::new(ConcurrentChainedPool::<u64>::new(32, 8).unwrap());
    let kept = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u64)
        .map(|thread_id| {
            let pool = Arc::clone(&pool);
            let kept = Arc::clone(&kept);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut tail = Vec::new();
                for i in 0..1_000 {
                    let Some(block) = pool.create(thread_id * 1_000 + i) else {
                        continue;
                    };
                    tail.push(block);
                    if tail.len() > 8 {
                        let block = tail.remove(0);
                        assert!(unsafe { pool.release(block) });
                    }
                }
                kept.fetch_add(tail.len(), Ordering::Relaxed);
                // Leak the tail on purpose; the main thread checks the count
                // and then releases nothing (the pool drop reclaims memory).
                std::mem::forget(tail);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.stats().live_blocks, kept.load(Ordering::Relaxed));
}
