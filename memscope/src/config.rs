//! Engine configuration.

use log::error;
use regex::Regex;

/// Tunables for the tracking engine. All fields are read at hook time;
/// construct once and hand to [`crate::MemScope`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Capture and hash a call chain for sampled allocations. When off,
    /// pointers are still tracked with their caller only.
    pub stacktrace_enabled: bool,

    /// Declared caller-based sampling mode. No policy is defined for it yet:
    /// while set, the sampling decision rejects every allocation.
    pub caller_sampling_enabled: bool,

    /// Lower size bound for sampling; zero means unbounded.
    pub sample_size_min: usize,

    /// Upper size bound for sampling; zero means unbounded.
    pub sample_size_max: usize,

    /// Probability in `0..=1` that an in-range allocation is sampled.
    pub sampling_probability: f64,

    /// Images whose attributed total stays below this many bytes are left
    /// out of the per-stack report sections.
    pub stack_log_threshold: usize,

    /// Unwind with quicken tables; when off, the frame-pointer fallback is
    /// used and captures are limited to the short frame budget.
    pub quicken_unwind_enabled: bool,

    /// Frame budget for allocation-site captures and for thread captures in
    /// frame-pointer mode.
    pub max_frames_short: usize,

    /// Frame budget for thread captures in quicken mode.
    pub max_frames_long: usize,

    /// Thread-name regular expressions selecting which threads the
    /// provenance tracker enrolls.
    pub thread_name_filters: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stacktrace_enabled: false,
            caller_sampling_enabled: false,
            sample_size_min: 0,
            sample_size_max: 0,
            sampling_probability: 1.0,
            stack_log_threshold: 0,
            quicken_unwind_enabled: true,
            max_frames_short: 16,
            max_frames_long: 64,
            thread_name_filters: Vec::new(),
        }
    }
}

impl Options {
    /// Frame budget for thread provenance captures under the current unwind
    /// mode.
    #[must_use]
    pub fn thread_capture_frames(&self) -> usize {
        if self.quicken_unwind_enabled {
            self.max_frames_long
        } else {
            self.max_frames_short
        }
    }
}

/// Compiled thread-name filters.
pub(crate) struct NameFilters {
    patterns: Vec<Regex>,
}

impl NameFilters {
    /// Compile the filter strings; invalid patterns are logged and skipped.
    pub(crate) fn compile(filters: &[String]) -> Self {
        let patterns = filters
            .iter()
            .filter_map(|f| match Regex::new(f) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    error!("invalid thread name filter {f:?}: {err}");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub(crate) fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(!options.stacktrace_enabled);
        assert_eq!(options.sampling_probability, 1.0);
        assert_eq!(options.thread_capture_frames(), options.max_frames_long);
    }

    #[test]
    fn test_frame_budget_follows_unwind_mode() {
        let options = Options { quicken_unwind_enabled: false, ..Options::default() };
        assert_eq!(options.thread_capture_frames(), options.max_frames_short);
    }

    #[test]
    fn test_name_filters_match() {
        let filters = NameFilters::compile(&["worker-.*".to_string(), "render".to_string()]);
        assert!(filters.matches("worker-1"));
        assert!(filters.matches("render"));
        assert!(!filters.matches("idle"));
    }

    #[test]
    fn test_invalid_filter_is_skipped() {
        let filters = NameFilters::compile(&["worker-(".to_string(), "ok-.*".to_string()]);
        assert!(filters.matches("ok-1"));
        assert!(!filters.matches("worker-("));
    }
}
