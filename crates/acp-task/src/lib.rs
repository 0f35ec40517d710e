//! # acp-task
//!
//! Task lifecycle, approval gating and step progress for the agent control plane.
//!
//! A [`Task`] is one unit of requested agent work (a code change against a
//! repository/branch). Its [`TaskStatus`] only moves along the transition
//! table enforced by [`TaskStatus::can_transition_to`], and terminal tasks are
//! kept forever for audit.
//!
//! ## Key components
//!
//! - [`Task`]: the lifecycle state machine (queued → running → completed/failed/canceled,
//!   queued → rejected, queued → canceled)
//! - [`ApprovalItem`]: a decision gating a single plan step; immutable once decided
//! - [`ProgressLedger`]: additive sets of completed/failed/rejected step ids
//! - [`TaskStore`]: the durable keyed store, with [`JsonFileStore`] and [`MemoryStore`]

pub mod approval;
pub mod error;
pub mod progress;
pub mod store;
pub mod task;

pub use approval::{validate_step_id, ApprovalItem, Decision};
pub use error::TaskError;
pub use progress::{ProgressLedger, ProgressSummary, StepOutcome};
pub use store::{JsonFileStore, MemoryStore, TaskStore};
pub use task::{ControlAction, NewTask, Priority, RequestedControl, Task, TaskStatus};
