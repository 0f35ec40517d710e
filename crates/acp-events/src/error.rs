// error.rs: Error types for the event log.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while appending to or reading the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    /// Failed to open or create the log file.
    #[error("failed to open event log at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to write or read the log. The append did not happen.
    #[error("event log I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// A complete record could not be (de)serialized.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The log's internal lock was poisoned by a panicking writer.
    #[error("event log unavailable: {0}")]
    Unavailable(String),

    /// The hash chain is broken: a record was inserted, removed or edited.
    #[error("integrity check failed at line {line}: expected hash {expected}, got {actual}")]
    IntegrityViolation {
        line: usize,
        expected: String,
        actual: String,
    },

    /// Sequence numbers are not contiguous.
    #[error("sequence gap at line {line}: expected seq {expected}, got {actual}")]
    SequenceGap {
        line: usize,
        expected: u64,
        actual: u64,
    },
}
