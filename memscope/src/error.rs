//! Structured error types for memscope.
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Note that hook entry points never return errors: instrumentation must be
//! transparent to the host program, so failures there degrade to "no stack"
//! and a counter.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    SerializationFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
