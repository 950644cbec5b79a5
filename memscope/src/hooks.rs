//! Hook entry points.
//!
//! The upstream function-interposition layer calls these for every
//! allocator, mapping, and thread event it intercepts. Nothing here may
//! disturb the host program: null pointers and unknown pointers are ignored,
//! unwind failures degrade to caller-only records, and a thread-local guard
//! keeps the engine's own work from re-entering the hooks.

use std::cell::Cell;

use log::error;

use crate::tracker::{hash_frames, should_sample, PtrMeta};
use crate::MemScope;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// RAII reentrancy guard. `enter` fails when this thread is already inside
/// a hook, which is how engine-internal allocations and captures are
/// recognized and skipped.
pub(crate) struct HookGuard;

impl HookGuard {
    pub(crate) fn enter() -> Option<Self> {
        IN_HOOK.with(|flag| {
            if flag.get() {
                None
            } else {
                flag.set(true);
                Some(HookGuard)
            }
        })
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        IN_HOOK.with(|flag| flag.set(false));
    }
}

impl MemScope {
    /// A heap allocation was observed.
    pub fn on_alloc(&self, caller: u64, ptr: u64, size: usize) {
        self.acquire(caller, ptr, size, false);
    }

    /// A heap pointer was released.
    pub fn on_free(&self, ptr: u64) {
        self.release(ptr);
    }

    /// A memory mapping was created.
    pub fn on_map(&self, caller: u64, ptr: u64, size: usize) {
        self.acquire(caller, ptr, size, true);
    }

    /// A memory mapping was removed.
    pub fn on_unmap(&self, ptr: u64) {
        self.release(ptr);
    }

    fn acquire(&self, caller: u64, ptr: u64, size: usize, is_mapping: bool) {
        if ptr == 0 {
            error!("acquire hook with null pointer");
            return;
        }
        let Some(_guard) = HookGuard::enter() else { return };

        let (stack_hash, frames) =
            if self.options.stacktrace_enabled && should_sample(&self.options, size) {
                match self.capture_chain(self.options.max_frames_short) {
                    Some(frames) if !frames.is_empty() => (hash_frames(&frames), Some(frames)),
                    _ => (0, None),
                }
            } else {
                (0, None)
            };

        self.tracker.insert(PtrMeta { ptr, size, caller, is_mapping, stack_hash }, frames);
    }

    fn release(&self, ptr: u64) {
        if ptr == 0 {
            error!("release hook with null pointer");
            return;
        }
        let Some(_guard) = HookGuard::enter() else { return };
        self.tracker.erase(ptr);
    }

    /// A thread was created; called on the parent thread.
    ///
    /// Captures the creating context's chain (and, outside quicken mode, the
    /// higher-language stack under its timed lock), then releases the child
    /// routine. A reentrant invocation releases the child without recording.
    pub fn on_thread_create(&self, handle: u64) {
        let Some(_guard) = HookGuard::enter() else {
            self.threads.notify_recorded(handle);
            return;
        };

        // Until the first rename arrives this thread reports under a
        // synthetic name derived from its handle.
        let name = format!("tid-{handle}");

        let runtime_stack = if !self.options.quicken_unwind_enabled {
            self.runtime_stacks
                .as_deref()
                .and_then(|provider| self.threads.capture_runtime_stack(provider))
        } else {
            None
        };

        let frames = self
            .capture_chain(self.options.thread_capture_frames())
            .unwrap_or_default();
        self.threads.on_create(handle, &name, frames, runtime_stack);
    }

    /// A thread's routine is about to run; blocks until the creation hook
    /// has recorded (or explicitly skipped) the thread.
    pub fn on_thread_routine_start(&self, handle: u64) {
        self.threads.wait_until_recorded(handle);
    }

    /// A thread was renamed.
    pub fn on_thread_setname(&self, handle: u64, name: &str) {
        let Some(_guard) = HookGuard::enter() else { return };
        self.threads.on_setname(handle, name);
    }

    /// A thread exited.
    pub fn on_thread_destroy(&self, handle: u64) {
        self.threads.on_destroy(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_blocks_reentry() {
        let outer = HookGuard::enter();
        assert!(outer.is_some());
        assert!(HookGuard::enter().is_none());
        drop(outer);
        assert!(HookGuard::enter().is_some());
    }

    #[test]
    fn test_guard_is_per_thread() {
        let _outer = HookGuard::enter().unwrap();
        std::thread::spawn(|| {
            assert!(HookGuard::enter().is_some());
        })
        .join()
        .unwrap();
    }
}
