// error.rs: Error types for the control plane.
//
// Every variant carries a stable machine-readable code (see `code()`); the
// HTTP layer maps codes to status codes and never invents its own.

use acp_events::EventLogError;
use acp_task::TaskError;
use thiserror::Error;
use uuid::Uuid;

use crate::backend::BackendError;

/// Errors surfaced by the router and the reconciliation loop.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Malformed or missing input. Nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// A contradictory approval decision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The command has no transition from the task's current status.
    #[error("invalid transition from {from} to {to} for task {task_id}")]
    InvalidTransition {
        task_id: Uuid,
        from: String,
        to: String,
    },

    /// The durable store or event log failed; prior committed state is intact.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The execution backend refused or failed a dispatch/stop request.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ControlError {
    /// Stable error code for API responses and logs.
    pub fn code(&self) -> &'static str {
        match self {
            ControlError::Validation(_) => "validation_error",
            ControlError::TaskNotFound(_) => "not_found",
            ControlError::Conflict(_) => "conflict",
            ControlError::InvalidTransition { .. } => "invalid_transition",
            ControlError::StoreUnavailable(_) => "store_unavailable",
            ControlError::Backend(_) => "backend_unavailable",
        }
    }
}

impl From<TaskError> for ControlError {
    fn from(e: TaskError) -> Self {
        match e {
            TaskError::Validation(msg) => ControlError::Validation(msg),
            TaskError::InvalidTransition { task_id, from, to } => {
                ControlError::InvalidTransition { task_id, from, to }
            }
            e @ TaskError::DecisionConflict { .. } => ControlError::Conflict(e.to_string()),
            e => ControlError::StoreUnavailable(e.to_string()),
        }
    }
}

/// Convert EventLogError to ControlError (an append failure means the
/// mutation it belonged to did not happen).
impl From<EventLogError> for ControlError {
    fn from(e: EventLogError) -> Self {
        ControlError::StoreUnavailable(e.to_string())
    }
}
