// error.rs: Error types for the task registry and its ledgers.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while validating, transitioning or persisting tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    /// A file I/O operation against the durable store failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize a stored row.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The store cannot serve requests right now (poisoned lock, backend down).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A required field is missing or malformed. Nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Invalid state transition.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    /// A step already holds a different final decision.
    #[error("step {step_id} of task {task_id} is already {existing}, cannot record {requested}")]
    DecisionConflict {
        task_id: Uuid,
        step_id: String,
        existing: String,
        requested: String,
    },
}
