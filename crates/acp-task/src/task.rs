// task.rs: Task: one unit of requested agent work and its lifecycle.
//
// The state machine enforces a valid lifecycle:
//   queued → running → completed | failed | canceled
//   queued → canceled   (cancel applied synchronously)
//   queued → rejected   (approval denied / failed pre-flight)
//
// completed, failed, canceled and rejected are terminal. Terminal tasks are
// never deleted; they stay in the store for audit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// The lifecycle status of a Task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and waiting to be dispatched to a worker.
    Queued,
    /// Picked up for execution.
    Running,
    /// Execution finished successfully.
    Completed,
    /// Execution finished with a failure.
    Failed,
    /// Stopped by a cancel command.
    Canceled,
    /// Denied before it ever ran.
    Rejected,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl TaskStatus {
    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Rejected
        )
    }

    /// Check whether transitioning from this status to `next` is valid.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Queued, TaskStatus::Running)
                | (TaskStatus::Queued, TaskStatus::Canceled)
                | (TaskStatus::Queued, TaskStatus::Rejected)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Canceled)
        )
    }
}

/// Presentation/sequencing hint. Lower is more urgent; never preempts.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum Priority {
    #[serde(alias = "p0")]
    P0,
    #[serde(alias = "p1")]
    P1,
    #[default]
    #[serde(alias = "p2")]
    P2,
    #[serde(alias = "p3")]
    P3,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        f.write_str(s)
    }
}

/// An action a control command can carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Approve,
    Reject,
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControlAction::Cancel => "cancel",
            ControlAction::Approve => "approve",
            ControlAction::Reject => "reject",
        };
        f.write_str(s)
    }
}

/// A control action accepted for a task but not applied yet.
///
/// Only `cancel` against a running task is ever deferred; the reconciliation
/// loop clears it once the execution side confirms the stop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedControl {
    pub action: ControlAction,
    pub requested_by: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// The fields a caller supplies to create a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub risk_profile: String,
    /// When set, the task waits for an `approve` command before dispatch.
    #[serde(default)]
    pub requires_approval: bool,
}

impl NewTask {
    pub fn new(goal: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            repo: repo.into(),
            branch: default_branch(),
            ..Self::default()
        }
    }

    /// Reject malformed input before anything is persisted.
    pub fn validate(&self) -> Result<(), TaskError> {
        if self.goal.trim().is_empty() {
            return Err(TaskError::Validation("goal must not be empty".into()));
        }
        if self.repo.trim().is_empty() {
            return Err(TaskError::Validation("repo must not be empty".into()));
        }
        Ok(())
    }
}

/// One unit of agent work, from submission to a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    /// Unique identifier, allocated at creation and never reused.
    pub id: Uuid,

    /// Free-text description of the work. Opaque to the control plane.
    pub goal: String,

    /// Target repository location.
    pub repo: String,

    /// Target branch.
    pub branch: String,

    /// Ordered acceptance criteria, opaque to the control plane.
    pub acceptance_criteria: Vec<String>,

    pub priority: Priority,

    /// Label consumed by downstream policy; never interpreted here.
    pub risk_profile: String,

    /// Whether dispatch waits for an explicit approval.
    #[serde(default)]
    pub requires_approval: bool,

    /// Who approved the task for dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// A control action accepted but not yet applied.
    #[serde(default)]
    pub requested_control: Option<RequestedControl>,

    /// Reason recorded with the last terminal transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new queued task. Validates the input first.
    pub fn new(new_task: NewTask) -> Result<Self, TaskError> {
        new_task.validate()?;
        let now = Utc::now();
        let branch = if new_task.branch.trim().is_empty() {
            default_branch()
        } else {
            new_task.branch
        };
        Ok(Self {
            id: Uuid::new_v4(),
            goal: new_task.goal,
            repo: new_task.repo,
            branch,
            acceptance_criteria: new_task.acceptance_criteria,
            priority: new_task.priority,
            risk_profile: new_task.risk_profile,
            requires_approval: new_task.requires_approval,
            approved_by: None,
            status: TaskStatus::Queued,
            requested_control: None,
            status_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Transition to a new status. Returns an error if the transition is invalid.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                task_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Bump `updated_at` without ever moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when a cancel has been accepted but not yet applied.
    pub fn has_pending_cancel(&self) -> bool {
        matches!(
            self.requested_control,
            Some(RequestedControl {
                action: ControlAction::Cancel,
                ..
            })
        )
    }

    /// Whether the approval gate (if any) lets this task be dispatched.
    pub fn approval_satisfied(&self) -> bool {
        !self.requires_approval || self.approved_by.is_some()
    }
}
