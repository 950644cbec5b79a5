//! Thread provenance tracking.
//!
//! When a thread is created, the creating context's call chain is captured
//! and recorded against the new thread's handle, before the thread's own
//! routine is allowed to run: the child waits on a condition until the
//! parent-side record exists, so every later operation on the thread finds
//! its provenance in place. Records are removed by the thread-exit hook.
//!
//! Threads are enrolled when their name matches one of the configured
//! filters, and reclassified on every rename: a renamed thread that stops
//! matching leaves the enrolled set, one that starts matching joins it. The
//! original captured parent chain is kept either way.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};
use quickstep::Frame;

use crate::config::NameFilters;
use crate::tracker::{hash_combine, hash_frames, hash_text};

/// Thread names longer than this are illegal and ignored on rename, matching
/// the platform limit for thread names.
pub const MAX_THREAD_NAME: usize = 15;

/// How long a capture waits for the higher-language stack lock before giving
/// up; holding the creation path longer than this is worse than losing the
/// runtime stack.
pub const RUNTIME_CAPTURE_TIMEOUT: Duration = Duration::from_millis(100);

/// Source of the higher-language (interpreted runtime) stack text for the
/// current thread.
pub trait RuntimeStackProvider: Send + Sync {
    fn capture(&self) -> Option<String>;
}

/// Provenance of one observed thread.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub handle: u64,
    pub name: String,
    /// The creating context's native call chain.
    pub frames: Vec<Frame>,
    /// Text form of the higher-language stack, when one was captured.
    pub runtime_stack: Option<String>,
    /// Combined native + runtime hash; zero when nothing was captured.
    pub hash: u64,
}

/// Threads sharing one provenance hash, for dumps.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    pub hash: u64,
    pub frames: Vec<Frame>,
    pub runtime_stack: Option<String>,
    pub threads: Vec<(u64, String)>,
}

struct Inner {
    records: HashMap<u64, ThreadRecord>,
    enrolled: HashSet<u64>,
}

/// Mutex whose acquisition can time out, for the runtime stack capture.
struct TimedLock {
    busy: Mutex<bool>,
    freed: Condvar,
}

struct TimedGuard<'a>(&'a TimedLock);

impl TimedLock {
    fn new() -> Self {
        Self { busy: Mutex::new(false), freed: Condvar::new() }
    }

    fn acquire(&self, timeout: Duration) -> Option<TimedGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut busy = self.busy.lock().expect("timed lock poisoned");
        while *busy {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            let (guard, result) =
                self.freed.wait_timeout(busy, remaining).expect("timed lock poisoned");
            busy = guard;
            if result.timed_out() && *busy {
                return None;
            }
        }
        *busy = true;
        Some(TimedGuard(self))
    }
}

impl Drop for TimedGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.0.busy.lock().expect("timed lock poisoned");
        *busy = false;
        self.0.freed.notify_one();
    }
}

/// Registry of live threads keyed by thread handle.
pub struct ThreadTracker {
    filters: NameFilters,
    inner: Mutex<Inner>,
    ready: Mutex<HashSet<u64>>,
    ready_cv: Condvar,
    runtime_lock: TimedLock,
}

impl ThreadTracker {
    #[must_use]
    pub(crate) fn new(filters: NameFilters) -> Self {
        Self {
            filters,
            inner: Mutex::new(Inner { records: HashMap::new(), enrolled: HashSet::new() }),
            ready: Mutex::new(HashSet::new()),
            ready_cv: Condvar::new(),
            runtime_lock: TimedLock::new(),
        }
    }

    /// Capture the higher-language stack under the timed lock.
    ///
    /// Failing to acquire within the bound usually means a reentrant or
    /// wedged runtime; the capture is skipped rather than stalling thread
    /// creation.
    pub fn capture_runtime_stack(&self, provider: &dyn RuntimeStackProvider) -> Option<String> {
        match self.runtime_lock.acquire(RUNTIME_CAPTURE_TIMEOUT) {
            Some(_guard) => provider.capture(),
            None => {
                warn!("runtime stack capture lock timed out, skipping");
                None
            }
        }
    }

    /// Record a newly created thread and release its routine.
    ///
    /// Returns false when the handle was already recorded; the routine is
    /// released either way.
    pub fn on_create(
        &self,
        handle: u64,
        name: &str,
        frames: Vec<Frame>,
        runtime_stack: Option<String>,
    ) -> bool {
        let recorded = {
            let mut inner = self.inner.lock().expect("thread registry poisoned");
            if inner.records.contains_key(&handle) {
                debug!("thread {handle} already recorded");
                false
            } else {
                let native_hash = if frames.is_empty() { 0 } else { hash_frames(&frames) };
                let runtime_hash = runtime_stack.as_deref().map(hash_text).unwrap_or(0);
                let hash = if native_hash != 0 || runtime_hash != 0 {
                    hash_combine(native_hash, runtime_hash)
                } else {
                    0
                };
                if self.filters.matches(name) {
                    inner.enrolled.insert(handle);
                }
                inner.records.insert(
                    handle,
                    ThreadRecord {
                        handle,
                        name: name.to_string(),
                        frames,
                        runtime_stack,
                        hash,
                    },
                );
                true
            }
        };
        self.notify_recorded(handle);
        recorded
    }

    /// Release the thread's routine without recording, for reentrant capture
    /// paths.
    pub fn notify_recorded(&self, handle: u64) {
        let mut ready = self.ready.lock().expect("thread handshake poisoned");
        ready.insert(handle);
        self.ready_cv.notify_all();
    }

    /// Block until [`ThreadTracker::on_create`] (or the reentrant release)
    /// has run for this handle. Called on the child thread before the user's
    /// entry point.
    pub fn wait_until_recorded(&self, handle: u64) {
        let mut ready = self.ready.lock().expect("thread handshake poisoned");
        while !ready.contains(&handle) {
            ready = self.ready_cv.wait(ready).expect("thread handshake poisoned");
        }
        ready.remove(&handle);
    }

    /// Apply a rename: correct the stored name and reclassify against the
    /// filters. The originally captured chain is untouched.
    pub fn on_setname(&self, handle: u64, name: &str) {
        if name.is_empty() || name.len() > MAX_THREAD_NAME {
            warn!("illegal thread name (len {}), ignoring rename", name.len());
            return;
        }
        let mut inner = self.inner.lock().expect("thread registry poisoned");
        let Some(record) = inner.records.get_mut(&handle) else {
            debug!("rename for unrecorded thread {handle}");
            return;
        };
        debug!("thread {handle} renamed {} -> {name}", record.name);
        record.name = name.to_string();

        let matches = self.filters.matches(name);
        let enrolled = inner.enrolled.contains(&handle);
        if matches && !enrolled {
            inner.enrolled.insert(handle);
        } else if !matches && enrolled {
            inner.enrolled.remove(&handle);
        }
    }

    /// Remove a thread on exit.
    pub fn on_destroy(&self, handle: u64) {
        let mut inner = self.inner.lock().expect("thread registry poisoned");
        inner.records.remove(&handle);
        inner.enrolled.remove(&handle);
    }

    /// True when the thread currently matches the name filters.
    #[must_use]
    pub fn is_enrolled(&self, handle: u64) -> bool {
        self.inner.lock().expect("thread registry poisoned").enrolled.contains(&handle)
    }

    /// Look at one thread's record.
    pub fn get<R>(&self, handle: u64, visitor: impl FnOnce(&ThreadRecord) -> R) -> Option<R> {
        let inner = self.inner.lock().expect("thread registry poisoned");
        inner.records.get(&handle).map(visitor)
    }

    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.inner.lock().expect("thread registry poisoned").records.len()
    }

    /// Group the enrolled threads by provenance hash: one representative
    /// chain per hash plus every (handle, name) sharing it.
    #[must_use]
    pub fn dump_groups(&self) -> Vec<ThreadGroup> {
        let inner = self.inner.lock().expect("thread registry poisoned");
        let mut groups: HashMap<u64, ThreadGroup> = HashMap::new();
        for handle in &inner.enrolled {
            let Some(record) = inner.records.get(handle) else { continue };
            if record.hash == 0 {
                continue;
            }
            let group = groups.entry(record.hash).or_insert_with(|| ThreadGroup {
                hash: record.hash,
                frames: record.frames.clone(),
                runtime_stack: record.runtime_stack.clone(),
                threads: Vec::new(),
            });
            group.threads.push((record.handle, record.name.clone()));
        }
        let mut out: Vec<ThreadGroup> = groups.into_values().collect();
        out.sort_by(|a, b| b.threads.len().cmp(&a.threads.len()).then(a.hash.cmp(&b.hash)));
        for group in &mut out {
            group.threads.sort();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(filters: &[&str]) -> ThreadTracker {
        let filters: Vec<String> = filters.iter().map(|s| s.to_string()).collect();
        ThreadTracker::new(NameFilters::compile(&filters))
    }

    fn frame(pc: u64) -> Frame {
        Frame { pc, rel_pc: pc, image: None, is_interpreted: false }
    }

    #[test]
    fn test_create_enrolls_matching_name() {
        let tracker = tracker_with(&["worker-.*"]);
        assert!(tracker.on_create(1, "worker-1", vec![frame(0x10)], None));
        assert!(tracker.is_enrolled(1));
        assert!(tracker.on_create(2, "idle", vec![frame(0x10)], None));
        assert!(!tracker.is_enrolled(2));
        assert_eq!(tracker.thread_count(), 2);
    }

    #[test]
    fn test_duplicate_create_is_rejected_but_released() {
        let tracker = tracker_with(&[]);
        assert!(tracker.on_create(7, "a", Vec::new(), None));
        assert!(!tracker.on_create(7, "a", Vec::new(), None));
        // Both creates released the routine handshake.
        tracker.wait_until_recorded(7);
    }

    #[test]
    fn test_rename_reclassification_round_trip() {
        let tracker = tracker_with(&["worker-.*"]);
        let parent_chain = vec![frame(0x1000), frame(0x2000)];
        tracker.on_create(1, "worker-1", parent_chain.clone(), None);
        assert!(tracker.is_enrolled(1));

        tracker.on_setname(1, "idle");
        assert!(!tracker.is_enrolled(1));
        // Record survives un-enrollment.
        assert_eq!(tracker.thread_count(), 1);

        tracker.on_setname(1, "worker-1");
        assert!(tracker.is_enrolled(1));
        // The originally captured parent chain is still attached.
        let frames = tracker.get(1, |r| r.frames.clone()).unwrap();
        assert_eq!(frames.len(), parent_chain.len());
        assert_eq!(frames[0].pc, 0x1000);
    }

    #[test]
    fn test_illegal_rename_is_ignored() {
        let tracker = tracker_with(&["worker-.*"]);
        tracker.on_create(1, "worker-1", Vec::new(), None);
        tracker.on_setname(1, "");
        assert_eq!(tracker.get(1, |r| r.name.clone()).unwrap(), "worker-1");
        tracker.on_setname(1, "a-name-longer-than-the-limit");
        assert_eq!(tracker.get(1, |r| r.name.clone()).unwrap(), "worker-1");
    }

    #[test]
    fn test_destroy_removes_record() {
        let tracker = tracker_with(&["worker-.*"]);
        tracker.on_create(1, "worker-1", Vec::new(), None);
        tracker.on_destroy(1);
        assert_eq!(tracker.thread_count(), 0);
        assert!(!tracker.is_enrolled(1));
    }

    #[test]
    fn test_handshake_orders_create_before_routine() {
        use std::sync::Arc;

        let tracker = Arc::new(tracker_with(&[]));
        let child_tracker = Arc::clone(&tracker);
        let child = std::thread::spawn(move || {
            child_tracker.wait_until_recorded(42);
            // After the wait, the record must exist.
            child_tracker.get(42, |r| r.name.clone()).unwrap()
        });

        std::thread::sleep(Duration::from_millis(10));
        tracker.on_create(42, "late", Vec::new(), None);
        assert_eq!(child.join().unwrap(), "late");
    }

    #[test]
    fn test_dump_groups_by_hash() {
        let tracker = tracker_with(&[".*"]);
        let chain = vec![frame(0x1000)];
        tracker.on_create(1, "pool-1", chain.clone(), None);
        tracker.on_create(2, "pool-2", chain.clone(), None);
        tracker.on_create(3, "other", vec![frame(0x9999)], None);

        let groups = tracker.dump_groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].threads.len(), 2);
        assert_eq!(groups[0].threads, vec![(1, "pool-1".to_string()), (2, "pool-2".to_string())]);
        assert_eq!(groups[1].threads.len(), 1);
    }

    struct FixedRuntime;
    impl RuntimeStackProvider for FixedRuntime {
        fn capture(&self) -> Option<String> {
            Some("java.lang.Thread.run".to_string())
        }
    }

    #[test]
    fn test_runtime_capture_under_timed_lock() {
        let tracker = tracker_with(&[]);
        let stack = tracker.capture_runtime_stack(&FixedRuntime);
        assert_eq!(stack.as_deref(), Some("java.lang.Thread.run"));
    }

    #[test]
    fn test_timed_lock_times_out_when_held() {
        let lock = TimedLock::new();
        let guard = lock.acquire(Duration::from_millis(10)).unwrap();
        assert!(lock.acquire(Duration::from_millis(20)).is_none());
        drop(guard);
        assert!(lock.acquire(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_combined_hash_uses_runtime_stack() {
        let tracker = tracker_with(&[]);
        tracker.on_create(1, "a", vec![frame(0x10)], None);
        tracker.on_create(2, "b", vec![frame(0x10)], Some("runtime".to_string()));
        let h1 = tracker.get(1, |r| r.hash).unwrap();
        let h2 = tracker.get(2, |r| r.hash).unwrap();
        assert_ne!(h1, 0);
        assert_ne!(h2, 0);
        assert_ne!(h1, h2);
    }
}
