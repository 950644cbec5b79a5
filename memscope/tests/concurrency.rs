//! Concurrent hook traffic: interleaved acquire/release pairs from many
//! threads leave the tracker empty, and every stack's accumulated size
//! settles at zero.

use std::sync::Arc;

use memscope::tracker::{AllocationTracker, PtrMeta, DEFAULT_SHARDS};
use memscope::{MemScope, NullCapture, Options};
use quickstep::{Arch, ImageRegistry, SliceMemory, StaticMaps, TableCache};

const THREADS: u64 = 8;
const PAIRS: u64 = 2_000;

#[test]
fn alloc_free_pairs_leave_tracker_empty() {
    let registry = ImageRegistry::new(Box::new(StaticMaps(Vec::new())));
    registry.refresh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(MemScope::new(
        Options::default(),
        Arch::Arm64,
        registry,
        TableCache::new(dir.path()).unwrap(),
        Box::new(SliceMemory::new()),
        Box::new(NullCapture),
    ));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || {
                // Distinct pointers per thread.
                let base = 0x1000_0000 + t * 0x10_0000;
                for i in 0..PAIRS {
                    let ptr = base + i * 32;
                    engine.on_alloc(0x4000 + t, ptr, 48);
                    engine.on_free(ptr);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(engine.tracker().pointer_count(), 0);
}

#[test]
fn stack_sizes_settle_at_zero() {
    let tracker = Arc::new(AllocationTracker::new(DEFAULT_SHARDS));
    let hashes: Vec<u64> = (1..=4).collect();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let tracker = Arc::clone(&tracker);
            let hashes = hashes.clone();
            std::thread::spawn(move || {
                let base = 0x2000_0000 + t * 0x10_0000;
                for i in 0..PAIRS {
                    let ptr = base + i * 32;
                    let hash = hashes[(i % hashes.len() as u64) as usize];
                    tracker.insert(
                        PtrMeta {
                            ptr,
                            size: 16 + (i as usize % 5) * 8,
                            caller: 0x4000,
                            is_mapping: false,
                            stack_hash: hash,
                        },
                        Some(Vec::new()),
                    );
                    tracker.erase(ptr);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(tracker.pointer_count(), 0);
    for hash in hashes {
        assert_eq!(tracker.stack_size(hash), Some(0), "hash {hash} not settled");
    }
}

#[test]
fn free_of_unknown_pointer_is_tolerated() {
    let registry = ImageRegistry::new(Box::new(StaticMaps(Vec::new())));
    registry.refresh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let engine = MemScope::new(
        Options::default(),
        Arch::Arm64,
        registry,
        TableCache::new(dir.path()).unwrap(),
        Box::new(SliceMemory::new()),
        Box::new(NullCapture),
    );

    engine.on_free(0xdead_0000);
    engine.on_unmap(0xdead_0000);
    assert_eq!(engine.tracker().pointer_count(), 0);
}
