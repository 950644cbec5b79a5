//! Structured error types for quickstep.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Unwinder step failures are values carried on the unwind result, never
//! panics: the unwinder truncates, returns the frames collected so far, and
//! annotates the result with the error kind.

use thiserror::Error;

/// Why an unwind stopped early.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnwindError {
    #[error("process map table is unavailable")]
    MapsNull,

    #[error("program counter is not covered by any mapped image")]
    InvalidMap,

    #[error("image has no usable unwind table")]
    InvalidElf,

    #[error("memory load outside the thread stack")]
    InvalidMemory,

    #[error("step program contains an unsupported operation")]
    Unsupported,

    #[error("frame budget exhausted")]
    MaxFramesExceeded,

    #[error("no progress between steps")]
    RepeatedFrame,
}

impl UnwindError {
    /// Stable index used by the error counters exposed in reports.
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            UnwindError::MapsNull => 0,
            UnwindError::InvalidMap => 1,
            UnwindError::InvalidElf => 2,
            UnwindError::InvalidMemory => 3,
            UnwindError::Unsupported => 4,
            UnwindError::MaxFramesExceeded => 5,
            UnwindError::RepeatedFrame => 6,
        }
    }

    /// All kinds, in [`UnwindError::index`] order.
    pub const ALL: [UnwindError; 7] = [
        UnwindError::MapsNull,
        UnwindError::InvalidMap,
        UnwindError::InvalidElf,
        UnwindError::InvalidMemory,
        UnwindError::Unsupported,
        UnwindError::MaxFramesExceeded,
        UnwindError::RepeatedFrame,
    ];
}

/// Failures of the on-disk table cache and the table builder.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("no cached table for {0}")]
    TableMissing(String),

    #[error("cached table for {identity} is corrupt: {reason}")]
    TableCorrupt { identity: String, reason: String },

    #[error("building unwind table failed: {0}")]
    BuildFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// The recovery policy treats a corrupt table exactly like a missing one.
    #[must_use]
    pub fn is_missing_or_corrupt(&self) -> bool {
        matches!(self, CacheError::TableMissing(_) | CacheError::TableCorrupt { .. })
    }
}
