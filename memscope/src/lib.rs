//! # Memscope - In-Process Allocation and Thread Provenance Tracking
//!
//! Memscope attributes every native heap and mapping event observed by an
//! upstream interposition layer to its originating call chain, aggregating
//! by chain and by responsible image into rankable reports. Call chains come
//! from [`quickstep`]'s table-driven unwinder; the engine itself runs inside
//! the traced process across all of its threads.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │            Interposition layer (malloc/mmap/pthread)       │
//! └──────┬──────────────────────────────────┬──────────────────┘
//!        │ on_alloc / on_free / on_map      │ on_thread_*
//!        ▼                                  ▼
//! ┌──────────────────┐             ┌──────────────────┐
//! │ AllocationTracker│             │  ThreadTracker   │
//! │  (sharded ptr    │             │  (provenance +   │
//! │   map + stacks)  │             │   name filters)  │
//! └──────┬───────────┘             └──────┬───────────┘
//!        │      sampled? → capture chain  │
//!        └──────────────┬─────────────────┘
//!                       ▼
//!              ┌──────────────────┐        ┌──────────────┐
//!              │    quickstep     │───────▶│    Report    │
//!              │ (unwinder+cache) │  dump  │ (ranked JSON)│
//!              └──────────────────┘        └──────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`config`]: the engine options
//! - [`hooks`]: hook entry points with the reentrancy guard
//! - [`tracker`]: sharded pointer map, stack map, sampling, frame hashing
//! - [`threads`]: thread provenance with the creation handshake and rename
//!   reclassification
//! - [`report`]: snapshot aggregation, ranking, counters, JSON output
//!
//! ## Lifecycle
//!
//! Process-wide state is explicit: build a [`MemScope`], pass it wherever it
//! is needed, or [`init`] it as the process-global engine for the
//! interposition layer and [`teardown`] it at unload. Tests construct
//! engines with scripted providers and never touch the global.

pub mod config;
pub mod error;
pub mod hooks;
pub mod report;
pub mod threads;
pub mod tracker;

use std::ops::Range;
use std::sync::{Arc, Mutex};

use log::{info, warn};
use quickstep::unwinder::InterpretedPcSource;
use quickstep::{
    Arch, Frame, ImageRegistry, ProcessMemory, RegisterFile, TableCache, UnwindCursor, Unwinder,
};

pub use config::Options;
pub use error::ReportError;
pub use report::{build_report, ErrorCounters, Report};
pub use threads::{RuntimeStackProvider, ThreadTracker};
pub use tracker::AllocationTracker;

use config::NameFilters;

/// Register state and stack bounds captured from the current thread, the
/// starting point of every unwind.
pub struct CapturedState {
    pub regs: RegisterFile,
    pub stack: Range<u64>,
}

/// Source of the current thread's register state.
///
/// The interposition layer supplies the real implementation (signal context
/// or explicit capture); tests script one.
pub trait CaptureProvider: Send + Sync {
    fn capture(&self) -> Option<CapturedState>;
}

/// Capture provider for deployments without register capture: every sample
/// degrades to caller-only tracking.
pub struct NullCapture;

impl CaptureProvider for NullCapture {
    fn capture(&self) -> Option<CapturedState> {
        None
    }
}

/// The tracking engine. One instance serves the whole process.
pub struct MemScope {
    pub(crate) options: Options,
    pub(crate) arch: Arch,
    pub(crate) registry: ImageRegistry,
    pub(crate) cache: TableCache,
    pub(crate) memory: Box<dyn ProcessMemory>,
    pub(crate) capture: Box<dyn CaptureProvider>,
    pub(crate) runtime_stacks: Option<Box<dyn RuntimeStackProvider>>,
    pub(crate) interpreted: Option<Box<dyn InterpretedPcSource + Send + Sync>>,
    pub(crate) tracker: AllocationTracker,
    pub(crate) threads: ThreadTracker,
    pub(crate) counters: ErrorCounters,
}

impl MemScope {
    #[must_use]
    pub fn new(
        options: Options,
        arch: Arch,
        registry: ImageRegistry,
        cache: TableCache,
        memory: Box<dyn ProcessMemory>,
        capture: Box<dyn CaptureProvider>,
    ) -> Self {
        let filters = NameFilters::compile(&options.thread_name_filters);
        Self {
            threads: ThreadTracker::new(filters),
            tracker: AllocationTracker::new(tracker::DEFAULT_SHARDS),
            counters: ErrorCounters::default(),
            runtime_stacks: None,
            interpreted: None,
            options,
            arch,
            registry,
            cache,
            memory,
            capture,
        }
    }

    /// Attach a higher-language stack source for thread provenance.
    #[must_use]
    pub fn with_runtime_stacks(mut self, provider: Box<dyn RuntimeStackProvider>) -> Self {
        self.runtime_stacks = Some(provider);
        self
    }

    /// Attach an interpreted-pc side channel for the unwinder.
    #[must_use]
    pub fn with_interpreted_source(
        mut self,
        source: Box<dyn InterpretedPcSource + Send + Sync>,
    ) -> Self {
        self.interpreted = Some(source);
        self
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    #[must_use]
    pub fn tracker(&self) -> &AllocationTracker {
        &self.tracker
    }

    #[must_use]
    pub fn threads(&self) -> &ThreadTracker {
        &self.threads
    }

    /// External code signals that an image was loaded (or unloaded): re-read
    /// the process map table.
    pub fn notify_image_loaded(&self) {
        if let Err(err) = self.registry.refresh() {
            warn!("map table refresh failed: {err}");
        }
    }

    /// Drain the pending table-build requests, building and persisting each
    /// one. Meant to be called periodically off the allocation path. Returns
    /// how many tables were built.
    pub fn warm_up(&self) -> usize {
        let pending = self.cache.consume_requests();
        if pending.is_empty() {
            return 0;
        }
        let images = self.registry.snapshot();
        let mut built = 0;
        for request in pending {
            let Some(image) =
                images.iter().find(|image| image.content_hash == request.content_hash)
            else {
                // Unmapped since the request was recorded.
                continue;
            };
            match self.cache.build_and_save(image, self.arch) {
                Ok((_, stats)) => {
                    self.counters.add_build(&stats);
                    built += 1;
                }
                Err(err) => {
                    warn!("deferred build for {} failed: {err}", request.path);
                    self.counters.record_cache(&err);
                }
            }
        }
        built
    }

    /// Produce the structured report from the current state.
    #[must_use]
    pub fn dump(&self) -> Report {
        build_report(&self.tracker, &self.threads, &self.registry, &self.options, &self.counters)
    }

    /// Produce the report and serialize it as JSON.
    ///
    /// # Errors
    /// Propagates serialization and I/O failures.
    pub fn dump_json<W: std::io::Write>(&self, writer: W) -> Result<(), ReportError> {
        self.dump().write_json(writer)
    }

    /// Capture the current thread's call chain.
    ///
    /// Any unwinder error counts as "no stack": the error is tallied and the
    /// partial frames are discarded, per the recovery policy.
    pub(crate) fn capture_chain(&self, max_frames: usize) -> Option<Vec<Frame>> {
        let state = self.capture.capture()?;
        let mut unwinder = Unwinder::new(&self.registry, &self.cache, self.memory.as_ref())
            .with_quicken(self.options.quicken_unwind_enabled);
        if let Some(source) = self.interpreted.as_deref() {
            unwinder = unwinder.with_interpreted_source(source);
        }

        let mut cursor = UnwindCursor::new(state.regs);
        let result = unwinder.unwind(&mut cursor, &state.stack, max_frames);
        if let Some(error) = result.error {
            self.counters.record_unwind(error);
            return None;
        }
        Some(result.frames)
    }
}

// =============================================================================
// PROCESS-GLOBAL ENGINE
// =============================================================================

static ENGINE: Mutex<Option<Arc<MemScope>>> = Mutex::new(None);

/// Install `engine` as the process-global instance the interposition layer
/// dispatches to. Replaces any previous instance.
pub fn init(engine: MemScope) -> Arc<MemScope> {
    let engine = Arc::new(engine);
    let mut slot = ENGINE.lock().expect("engine slot poisoned");
    if slot.is_some() {
        warn!("engine re-initialized");
    }
    *slot = Some(Arc::clone(&engine));
    info!("memscope engine installed");
    engine
}

/// The process-global engine, if one is installed.
#[must_use]
pub fn global() -> Option<Arc<MemScope>> {
    ENGINE.lock().expect("engine slot poisoned").clone()
}

/// Uninstall and return the process-global engine. In-flight holders keep
/// their references; new hook dispatches see no engine.
pub fn teardown() -> Option<Arc<MemScope>> {
    let mut slot = ENGINE.lock().expect("engine slot poisoned");
    if slot.is_some() {
        info!("memscope engine removed");
    }
    slot.take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickstep::{SliceMemory, StaticMaps};

    fn test_engine() -> MemScope {
        let registry = ImageRegistry::new(Box::new(StaticMaps(Vec::new())));
        registry.refresh().unwrap();
        let dir = tempfile::tempdir().unwrap();
        MemScope::new(
            Options::default(),
            Arch::Arm64,
            registry,
            TableCache::new(dir.path()).unwrap(),
            Box::new(SliceMemory::new()),
            Box::new(NullCapture),
        )
    }

    #[test]
    fn test_init_global_teardown_cycle() {
        let _ = teardown();
        let engine = init(test_engine());
        let fetched = global().expect("engine installed");
        assert!(Arc::ptr_eq(&engine, &fetched));

        let removed = teardown().expect("engine removed");
        assert!(Arc::ptr_eq(&engine, &removed));
        assert!(global().is_none());
    }

    #[test]
    fn test_null_capture_degrades_to_caller_only() {
        let engine = test_engine();
        assert!(engine.capture_chain(8).is_none());
    }
}
