//! Integration tests for the concrete scenarios in spec.md §8.
//!
//! Scenario 1 (create/construct/close/reopen/find/destroy), 5 (crash-sim
//! refusal) and 6 (snapshot independence) are covered by `#[cfg(test)]`
//! modules inline in `src/manager.rs`, alongside the component the
//! scenario mostly exercises. The remaining scenarios — concurrent
//! allocate/deallocate, insertion-order reuse, and large-object placement —
//! exercise the segment allocator directly and live here instead.

use persist_heap::config::{RuntimeConfig, CHUNK_SIZE};
use persist_heap::segment_allocator::SegmentAllocator;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

/// Scenario 2: one thread per core, repeatedly allocating and deallocating
/// small 8-byte objects in random order; after everything unwinds, the
/// chunk directory is fully drained back to empty.
#[test]
fn concurrent_allocate_deallocate_drains_back_to_empty() {
    let dir = tempdir().unwrap();
    let alloc = Arc::new(
        SegmentAllocator::create(dir.path(), 256 * 1024 * 1024, RuntimeConfig::default()).unwrap(),
    );

    let num_threads = 4;
    let iterations = 1 << 12;
    let handles: Vec<_> = (0..num_threads)
        .map(|seed| {
            let alloc = Arc::clone(&alloc);
            thread::spawn(move || {
                let mut live = Vec::new();
                let mut rng_state = seed as u64 * 2654435761 + 1;
                let mut next_rand = move || {
                    rng_state ^= rng_state << 13;
                    rng_state ^= rng_state >> 7;
                    rng_state ^= rng_state << 17;
                    rng_state
                };
                for _ in 0..iterations {
                    if live.is_empty() || next_rand() % 2 == 0 {
                        let offset = alloc.allocate(8);
                        assert_ne!(offset, persist_heap::NULL_OFFSET);
                        live.push(offset);
                    } else {
                        let idx = (next_rand() as usize) % live.len();
                        let offset = live.swap_remove(idx);
                        alloc.deallocate(offset);
                    }
                }
                for offset in live {
                    alloc.deallocate(offset);
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // Caches may still be holding freed offsets; draining them is what
    // `serialize`/`close` does before persisting, and is what the scenario
    // means by "modulo cached objects, which `clear()` on close resolves".
    alloc.drain_caches();
    // Every chunk used by the threads above should have been fully
    // reclaimed: a fresh allocation is refilled straight from chunk 0
    // rather than from some chunk deep into the segment.
    let probe = alloc.allocate(8);
    assert_ne!(probe, persist_heap::NULL_OFFSET);
    assert!(
        (probe as usize) < CHUNK_SIZE,
        "expected reuse of the first chunk after full drain, got offset {}",
        probe
    );
}

/// Scenario 3: allocate 1024 max-small-size objects; their offsets are
/// strictly increasing multiples of that size across successive chunks.
/// Deallocating and reallocating in the same order (with the sorted bin
/// directory) reproduces the same offsets in the same order.
#[test]
fn max_small_size_offsets_increase_and_reappear_on_reuse() {
    let dir = tempdir().unwrap();
    let alloc = SegmentAllocator::create(
        dir.path(),
        512 * 1024 * 1024,
        RuntimeConfig { disable_concurrency: true, ..Default::default() },
    )
    .unwrap();

    let max_small = CHUNK_SIZE / 2;
    let mut offsets = Vec::new();
    for i in 0..1024u64 {
        let offset = alloc.allocate(max_small);
        assert_ne!(offset, persist_heap::NULL_OFFSET);
        // Writing through every offset catches chunks handed out without
        // storage actually grown to back them (would SIGBUS instead of
        // just failing an assertion).
        let ptr = unsafe { alloc.base().offset(offset as isize) as *mut u64 };
        unsafe { ptr.write(i) };
        offsets.push(offset);
    }

    let mut prev = -1i64;
    for (i, &offset) in offsets.iter().enumerate() {
        assert!(offset > prev, "offsets must strictly increase");
        assert_eq!(offset as usize % max_small, 0, "offset must be a multiple of the object size");
        let ptr = unsafe { alloc.base().offset(offset as isize) as *const u64 };
        assert_eq!(unsafe { ptr.read() }, i as u64);
        prev = offset;
    }

    for &offset in &offsets {
        alloc.deallocate(offset);
    }
    let mut replayed = Vec::new();
    for _ in 0..1024 {
        replayed.push(alloc.allocate(max_small));
    }
    assert_eq!(replayed, offsets, "sorted bin directory reproduces the same allocation order");
}

/// Scenario 4: a 2-chunk large object at offset 0, then a 1-chunk object at
/// 2×CHUNK_SIZE; freeing the large object and then requesting a 3-chunk
/// object must place it on a 3-chunk-aligned run, never overlapping the
/// still-live 1-chunk object.
#[test]
fn large_object_reuse_does_not_overlap_surviving_neighbor() {
    let dir = tempdir().unwrap();
    let alloc = SegmentAllocator::create(
        dir.path(),
        512 * 1024 * 1024,
        RuntimeConfig { disable_concurrency: true, ..Default::default() },
    )
    .unwrap();

    let two_chunk = alloc.allocate(CHUNK_SIZE * 2 - 1);
    assert_eq!(two_chunk, 0);

    let one_chunk = alloc.allocate(CHUNK_SIZE);
    assert_eq!(one_chunk as usize, 2 * CHUNK_SIZE);

    alloc.deallocate(two_chunk);

    let three_chunk = alloc.allocate(CHUNK_SIZE * 3 - 1);
    assert_ne!(three_chunk, persist_heap::NULL_OFFSET);
    let three_chunk_start = three_chunk as usize / CHUNK_SIZE;
    let three_chunk_end = three_chunk_start + 3;
    let one_chunk_no = one_chunk as usize / CHUNK_SIZE;
    assert!(
        one_chunk_no < three_chunk_start || one_chunk_no >= three_chunk_end,
        "3-chunk run at [{}, {}) must not overlap the surviving 1-chunk object at {}",
        three_chunk_start,
        three_chunk_end,
        one_chunk_no
    );
}
