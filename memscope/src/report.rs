//! Snapshot aggregation and the structured report.
//!
//! A dump freezes the tracker maps shard by shard, attributes every live
//! pointer to the image of its allocation call site, re-derives per-stack
//! totals from the live pointers, and emits four ranked sections (heap and
//! mapping, each by image and by stack) plus the thread provenance groups
//! and the engine's error counters.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;
use quickstep::{BuildStats, CacheError, Frame, ImageRegistry, UnwindError};
use serde::Serialize;

use crate::config::Options;
use crate::error::ReportError;
use crate::threads::ThreadTracker;
use crate::tracker::AllocationTracker;

/// How many (size × count) clusters to keep per image.
const MAX_SIZE_CLUSTERS: usize = 5;

const UNKNOWN_IMAGE: &str = "<unknown>";

/// Bytes attributed to one image, with its most significant identical-size
/// allocation clusters.
#[derive(Debug, Clone, Serialize)]
pub struct ImageAggregate {
    pub image: String,
    pub bytes: u64,
    pub size_clusters: Vec<SizeCluster>,
}

/// `count` live allocations of exactly `size` bytes.
#[derive(Debug, Clone, Serialize)]
pub struct SizeCluster {
    pub size: u64,
    pub count: u64,
}

/// One ranked call chain.
#[derive(Debug, Clone, Serialize)]
pub struct StackEntry {
    pub bytes: u64,
    pub representative_image: String,
    pub frames_human_readable: Vec<String>,
    pub frames_compact: String,
}

/// Enrolled threads sharing one provenance hash.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadGroupEntry {
    pub hash: u64,
    pub count: usize,
    pub native_frames: Vec<String>,
    pub runtime_stack: Option<String>,
    pub threads: Vec<ThreadEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadEntry {
    pub handle: u64,
    pub name: String,
}

/// The full structured dump.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub by_image_heap: Vec<ImageAggregate>,
    pub by_image_mapping: Vec<ImageAggregate>,
    pub stacks_heap: Vec<StackEntry>,
    pub stacks_mapping: Vec<StackEntry>,
    pub threads: Vec<ThreadGroupEntry>,
    pub counters: CounterSnapshot,
}

impl Report {
    /// Serialize as JSON.
    ///
    /// # Errors
    /// Propagates serialization and I/O failures.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), ReportError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }
}

// =============================================================================
// ERROR COUNTERS
// =============================================================================

/// Process-lifetime counters for offline diagnosis. None of the recorded
/// conditions ever fail the enclosing allocation.
#[derive(Default)]
pub struct ErrorCounters {
    unwind: [AtomicU64; UnwindError::ALL.len()],
    table_missing: AtomicU64,
    table_corrupt: AtomicU64,
    build_failed: AtomicU64,
    builder: Mutex<BuildStats>,
}

impl ErrorCounters {
    pub fn record_unwind(&self, error: UnwindError) {
        self.unwind[error.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache(&self, error: &CacheError) {
        match error {
            CacheError::TableMissing(_) => self.table_missing.fetch_add(1, Ordering::Relaxed),
            CacheError::TableCorrupt { .. } => {
                self.table_corrupt.fetch_add(1, Ordering::Relaxed)
            }
            CacheError::BuildFailed(_) => self.build_failed.fetch_add(1, Ordering::Relaxed),
            CacheError::Io(_) => self.build_failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Fold one build's statistics into the running totals.
    pub fn add_build(&self, stats: &BuildStats) {
        let mut total = self.builder.lock().expect("builder counters poisoned");
        total.fdes_total += stats.fdes_total;
        total.fdes_bad += stats.fdes_bad;
        total.rows_total += stats.rows_total;
        total.records_emitted += stats.records_emitted;
        total.records_coalesced += stats.records_coalesced;
        total.unsupported_ranges += stats.unsupported_ranges;
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        let mut unwind_errors = BTreeMap::new();
        for kind in UnwindError::ALL {
            let count = self.unwind[kind.index()].load(Ordering::Relaxed);
            if count > 0 {
                unwind_errors.insert(error_key(kind).to_string(), count);
            }
        }
        let builder = *self.builder.lock().expect("builder counters poisoned");
        CounterSnapshot {
            unwind_errors,
            table_missing: self.table_missing.load(Ordering::Relaxed),
            table_corrupt: self.table_corrupt.load(Ordering::Relaxed),
            build_failed: self.build_failed.load(Ordering::Relaxed),
            builder: BuilderCounters {
                fdes_total: builder.fdes_total,
                fdes_bad: builder.fdes_bad,
                rows_total: builder.rows_total,
                records_emitted: builder.records_emitted,
                records_coalesced: builder.records_coalesced,
                unsupported_ranges: builder.unsupported_ranges,
            },
        }
    }
}

fn error_key(error: UnwindError) -> &'static str {
    match error {
        UnwindError::MapsNull => "maps_null",
        UnwindError::InvalidMap => "invalid_map",
        UnwindError::InvalidElf => "invalid_elf",
        UnwindError::InvalidMemory => "invalid_memory",
        UnwindError::Unsupported => "unsupported",
        UnwindError::MaxFramesExceeded => "max_frames_exceeded",
        UnwindError::RepeatedFrame => "repeated_frame",
    }
}

/// Frozen counter values embedded in the report.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub unwind_errors: BTreeMap<String, u64>,
    pub table_missing: u64,
    pub table_corrupt: u64,
    pub build_failed: u64,
    pub builder: BuilderCounters,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuilderCounters {
    pub fdes_total: u64,
    pub fdes_bad: u64,
    pub rows_total: u64,
    pub records_emitted: u64,
    pub records_coalesced: u64,
    pub unsupported_ranges: u64,
}

// =============================================================================
// AGGREGATION
// =============================================================================

#[derive(Default)]
struct ImageAccum {
    bytes: u64,
    size_counts: HashMap<u64, u64>,
}

struct StackAccum {
    bytes: u64,
    frames: Vec<Frame>,
    caller: u64,
}

/// Build a report from the current tracker state.
///
/// The view is consistent per shard, not globally atomic; concurrent frees
/// can only make the totals underestimates. Stack records left at zero are
/// purged once the snapshot is taken.
pub fn build_report(
    tracker: &AllocationTracker,
    threads: &ThreadTracker,
    registry: &ImageRegistry,
    options: &Options,
    counters: &ErrorCounters,
) -> Report {
    let mut heap_images: HashMap<String, ImageAccum> = HashMap::new();
    let mut mmap_images: HashMap<String, ImageAccum> = HashMap::new();
    let mut heap_stacks: HashMap<u64, StackAccum> = HashMap::new();
    let mut mmap_stacks: HashMap<u64, StackAccum> = HashMap::new();

    let mut pointers = 0usize;
    tracker.for_each(|meta, stack| {
        pointers += 1;
        let images = if meta.is_mapping { &mut mmap_images } else { &mut heap_images };
        let image = caller_image(registry, meta.caller);
        let accum = images.entry(image).or_default();
        accum.bytes += meta.size as u64;
        *accum.size_counts.entry(meta.size as u64).or_default() += 1;

        if let Some(stack) = stack {
            let stacks = if meta.is_mapping { &mut mmap_stacks } else { &mut heap_stacks };
            let entry = stacks.entry(meta.stack_hash).or_insert_with(|| StackAccum {
                bytes: 0,
                frames: stack.frames.clone(),
                caller: stack.caller,
            });
            // Per-pointer sizes are authoritative here; the resident
            // accumulated size only serves between snapshots.
            entry.bytes += meta.size as u64;
        }
    });
    debug!("report snapshot over {pointers} live pointers");

    let report = Report {
        by_image_heap: rank_images(heap_images),
        by_image_mapping: rank_images(mmap_images),
        stacks_heap: rank_stacks(heap_stacks, registry, options.stack_log_threshold as u64),
        stacks_mapping: rank_stacks(mmap_stacks, registry, options.stack_log_threshold as u64),
        threads: thread_groups(threads),
        counters: counters.snapshot(),
    };
    tracker.purge_dead_stacks();
    report
}

fn caller_image(registry: &ImageRegistry, caller: u64) -> String {
    registry.find(caller).map_or_else(|| UNKNOWN_IMAGE.to_string(), |image| image.path.clone())
}

fn rank_images(images: HashMap<String, ImageAccum>) -> Vec<ImageAggregate> {
    let mut out: Vec<ImageAggregate> = images
        .into_iter()
        .map(|(image, accum)| {
            let mut clusters: Vec<SizeCluster> = accum
                .size_counts
                .into_iter()
                .map(|(size, count)| SizeCluster { size, count })
                .collect();
            clusters.sort_by(|a, b| (b.size * b.count).cmp(&(a.size * a.count)));
            clusters.truncate(MAX_SIZE_CLUSTERS);
            ImageAggregate { image, bytes: accum.bytes, size_clusters: clusters }
        })
        .collect();
    out.sort_by(|a, b| b.bytes.cmp(&a.bytes).then_with(|| a.image.cmp(&b.image)));
    out
}

fn rank_stacks(
    stacks: HashMap<u64, StackAccum>,
    registry: &ImageRegistry,
    threshold: u64,
) -> Vec<StackEntry> {
    // Totals per representative image gate which stacks are worth printing.
    let mut image_totals: HashMap<String, u64> = HashMap::new();
    let entries: Vec<(String, StackAccum)> = stacks
        .into_values()
        .map(|accum| {
            let image = representative_image(registry, &accum);
            *image_totals.entry(image.clone()).or_default() += accum.bytes;
            (image, accum)
        })
        .collect();

    let mut out: Vec<StackEntry> = entries
        .into_iter()
        .filter(|(image, _)| image_totals[image] >= threshold)
        .map(|(image, accum)| StackEntry {
            bytes: accum.bytes,
            representative_image: image,
            frames_human_readable: frames_human_readable(&accum.frames),
            frames_compact: frames_compact(&accum.frames),
        })
        .collect();
    out.sort_by(|a, b| {
        b.bytes.cmp(&a.bytes).then_with(|| a.frames_compact.cmp(&b.frames_compact))
    });
    out
}

/// Image of the allocation call site; falls back to the innermost frame
/// that resolved to an image.
fn representative_image(registry: &ImageRegistry, accum: &StackAccum) -> String {
    if let Some(image) = registry.find(accum.caller) {
        return image.path.clone();
    }
    accum
        .frames
        .iter()
        .find_map(|frame| frame.image.as_ref().map(|image| image.path.clone()))
        .unwrap_or_else(|| UNKNOWN_IMAGE.to_string())
}

fn frames_human_readable(frames: &[Frame]) -> Vec<String> {
    frames
        .iter()
        .map(|frame| {
            if frame.is_interpreted {
                format!("#pc {:x} (interpreted)", frame.pc)
            } else {
                let image = frame
                    .image
                    .as_ref()
                    .map_or(UNKNOWN_IMAGE, |image| image.path.as_str());
                format!("#pc {:x} ({image})", frame.rel_pc)
            }
        })
        .collect()
}

/// Compact form: the image base name is emitted whenever it changes,
/// followed by the relative pc of each frame, all semicolon-terminated.
fn frames_compact(frames: &[Frame]) -> String {
    let mut out = String::new();
    let mut last_image = "";
    for frame in frames {
        let image = image_name_of(frame);
        if image != last_image {
            out.push_str(image);
            out.push(';');
            last_image = image;
        }
        out.push_str(&format!("{:x};", frame.rel_pc));
    }
    out
}

fn image_name_of(frame: &Frame) -> &str {
    if frame.is_interpreted {
        "interpreted"
    } else {
        frame.image.as_ref().map_or(UNKNOWN_IMAGE, |image| image.base_name.as_str())
    }
}

fn thread_groups(threads: &ThreadTracker) -> Vec<ThreadGroupEntry> {
    threads
        .dump_groups()
        .into_iter()
        .map(|group| ThreadGroupEntry {
            hash: group.hash,
            count: group.threads.len(),
            native_frames: frames_human_readable(&group.frames),
            runtime_stack: group.runtime_stack,
            threads: group
                .threads
                .into_iter()
                .map(|(handle, name)| ThreadEntry { handle, name })
                .collect(),
        })
        .collect()
}
