//! Sampling policy end to end: with the probability at zero, a flood of
//! allocation events produces pointer records but no stack records.

use memscope::{MemScope, NullCapture, Options};
use quickstep::{Arch, ImageRegistry, StaticMaps, TableCache};

fn engine(options: Options) -> (tempfile::TempDir, MemScope) {
    let registry = ImageRegistry::new(Box::new(StaticMaps(Vec::new())));
    registry.refresh().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cache = TableCache::new(dir.path()).unwrap();
    let engine = MemScope::new(
        options,
        Arch::Arm64,
        registry,
        cache,
        Box::new(quickstep::SliceMemory::new()),
        Box::new(NullCapture),
    );
    (dir, engine)
}

#[test]
fn probability_zero_yields_no_stacks() {
    let (_dir, engine) = engine(Options {
        stacktrace_enabled: true,
        sampling_probability: 0.0,
        ..Options::default()
    });

    const EVENTS: u64 = 1_000_000;
    for i in 0..EVENTS {
        engine.on_alloc(0x4000, 0x10_0000 + i * 16, 24);
    }

    assert_eq!(engine.tracker().pointer_count(), EVENTS as usize);
    assert_eq!(engine.tracker().stack_count(), 0);
}

#[test]
fn unsampled_pointers_keep_their_caller() {
    let (_dir, engine) = engine(Options {
        stacktrace_enabled: true,
        sampling_probability: 0.0,
        ..Options::default()
    });

    engine.on_alloc(0xabcd, 0x1000, 64);
    let (caller, stack_hash) = engine
        .tracker()
        .get(0x1000, |meta| (meta.caller, meta.stack_hash))
        .expect("pointer recorded");
    assert_eq!(caller, 0xabcd);
    assert_eq!(stack_hash, 0);
}

#[test]
fn stacktrace_disabled_skips_sampling_entirely() {
    let (_dir, engine) = engine(Options {
        stacktrace_enabled: false,
        sampling_probability: 1.0,
        ..Options::default()
    });

    engine.on_alloc(0x4000, 0x2000, 64);
    assert_eq!(engine.tracker().pointer_count(), 1);
    assert_eq!(engine.tracker().stack_count(), 0);
}
