// backend.rs: Pluggable collaborators of the reconciliation loop.
//
// Where work runs and how a stop is confirmed belong to the execution side,
// not the control plane. The loop talks to it through ExecutionBackend and
// asks DispatchPolicy / ApprovalTimeoutPolicy for the decisions that are
// configuration rather than invariants.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use acp_task::{ApprovalItem, Task};

/// A failure reported by the execution side.
#[derive(Debug, Error)]
#[error("execution backend error: {0}")]
pub struct BackendError(pub String);

/// The execution side of a task.
pub trait ExecutionBackend: Send + Sync {
    /// Hand a task to a worker.
    ///
    /// Called once per task, after the task has been committed as running.
    /// An error fails the task; the loop never retries a dispatch.
    fn dispatch(&self, task: &Task) -> Result<(), BackendError>;

    /// Ask the worker to stop. Must be idempotent; the loop calls it on every
    /// tick until the stop is confirmed.
    fn request_stop(&self, task: &Task) -> Result<(), BackendError>;

    /// Whether execution of `task` has actually stopped.
    fn confirm_stopped(&self, task: &Task) -> Result<bool, BackendError>;
}

/// Backend for a control plane with no worker attached: dispatch is pure
/// bookkeeping and every stop is confirmed immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackend;

impl ExecutionBackend for NoopBackend {
    fn dispatch(&self, task: &Task) -> Result<(), BackendError> {
        tracing::debug!(task_id = %task.id, "dispatch (no worker attached)");
        Ok(())
    }

    fn request_stop(&self, _task: &Task) -> Result<(), BackendError> {
        Ok(())
    }

    fn confirm_stopped(&self, _task: &Task) -> Result<bool, BackendError> {
        Ok(true)
    }
}

/// Decides whether an eligible queued task may start now.
pub trait DispatchPolicy: Send + Sync {
    /// `running` is the number of tasks currently running.
    fn may_dispatch(&self, task: &Task, running: usize) -> bool;
}

/// Caps the number of concurrently running tasks. `0` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct MaxRunning(pub usize);

impl DispatchPolicy for MaxRunning {
    fn may_dispatch(&self, _task: &Task, running: usize) -> bool {
        self.0 == 0 || running < self.0
    }
}

/// Decides when a pending approval has waited too long.
pub trait ApprovalTimeoutPolicy: Send + Sync {
    fn is_expired(&self, item: &ApprovalItem, now: DateTime<Utc>) -> bool;
}

/// Pending approvals wait forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverExpire;

impl ApprovalTimeoutPolicy for NeverExpire {
    fn is_expired(&self, _item: &ApprovalItem, _now: DateTime<Utc>) -> bool {
        false
    }
}

/// Pending approvals older than the given duration are auto-rejected.
/// Items without a `requested_at` never expire.
#[derive(Debug, Clone, Copy)]
pub struct ExpireAfter(pub Duration);

impl ApprovalTimeoutPolicy for ExpireAfter {
    fn is_expired(&self, item: &ApprovalItem, now: DateTime<Utc>) -> bool {
        item.is_pending()
            && item
                .requested_at
                .is_some_and(|requested| now - requested >= self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_task::{Decision, NewTask};
    use uuid::Uuid;

    #[test]
    fn max_running_caps_and_zero_is_unlimited() {
        let task = Task::new(NewTask::new("g", "r")).unwrap();
        assert!(MaxRunning(2).may_dispatch(&task, 1));
        assert!(!MaxRunning(2).may_dispatch(&task, 2));
        assert!(MaxRunning(0).may_dispatch(&task, 10_000));
    }

    #[test]
    fn expire_after_only_touches_old_pending_items() {
        let policy = ExpireAfter(Duration::seconds(30));
        let mut item = ApprovalItem::pending(Uuid::new_v4(), "s");
        let now = Utc::now();
        item.requested_at = Some(now - Duration::seconds(31));
        assert!(policy.is_expired(&item, now));

        item.requested_at = Some(now - Duration::seconds(5));
        assert!(!policy.is_expired(&item, now));

        item.requested_at = None;
        assert!(!policy.is_expired(&item, now));

        item.requested_at = Some(now - Duration::seconds(60));
        item.decide(Decision::Approved, "lead").unwrap();
        assert!(!policy.is_expired(&item, now));
    }

    #[test]
    fn never_expire_is_inert() {
        let mut item = ApprovalItem::pending(Uuid::new_v4(), "s");
        item.requested_at = Some(Utc::now() - Duration::days(365));
        assert!(!NeverExpire.is_expired(&item, Utc::now()));
    }
}
