// reconcile.rs: Reconciler: drives tasks toward their target state.
//
// One tick runs three independent scans over a snapshot of the store:
//   1. running tasks with a pending cancel → canceled once the backend confirms the stop
//   2. eligible queued tasks → running, in (priority, created_at) order
//   3. expired pending approvals → rejected
//
// The snapshot is only a hint. Each candidate is re-read under its own task
// lock before anything is decided, and a failure on one task is logged and
// counted without stopping the rest of the tick. At most one task lock is
// held at any time.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use acp_events::{EventType, NewEvent};
use acp_task::{Decision, Task, TaskStatus};

use crate::backend::{ApprovalTimeoutPolicy, BackendError, DispatchPolicy, ExecutionBackend};
use crate::error::ControlError;
use crate::router::ControlRouter;

/// Who auto-rejected an expired approval.
pub const RECONCILER_ACTOR: &str = "reconciler";

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TickReport {
    /// Running tasks moved to canceled.
    pub canceled: usize,
    /// Running tasks with a pending cancel whose stop is not confirmed yet.
    pub awaiting_stop: usize,
    /// Queued tasks moved to running.
    pub dispatched: usize,
    /// Pending approvals auto-rejected.
    pub expired: usize,
    /// Per-task failures, retried on the next tick.
    pub failures: Vec<TickFailure>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TickFailure {
    pub task_id: Option<Uuid>,
    pub stage: &'static str,
    pub code: &'static str,
    pub message: String,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self.canceled == 0
            && self.awaiting_stop == 0
            && self.dispatched == 0
            && self.expired == 0
            && self.failures.is_empty()
    }

    fn fail(&mut self, task_id: Option<Uuid>, stage: &'static str, err: &ControlError) {
        tracing::warn!(
            task_id = ?task_id,
            stage,
            code = err.code(),
            "reconciliation failed, retrying next tick: {}",
            err
        );
        self.failures.push(TickFailure {
            task_id,
            stage,
            code: err.code(),
            message: err.to_string(),
        });
    }
}

enum CancelStep {
    Canceled,
    AwaitingStop,
    Skipped,
}

/// The reconciliation loop body. The daemon calls [`Reconciler::tick`] on a timer.
#[derive(Clone)]
pub struct Reconciler {
    router: ControlRouter,
    backend: Arc<dyn ExecutionBackend>,
    dispatch: Arc<dyn DispatchPolicy>,
    approvals: Arc<dyn ApprovalTimeoutPolicy>,
}

impl Reconciler {
    pub fn new(
        router: ControlRouter,
        backend: Arc<dyn ExecutionBackend>,
        dispatch: Arc<dyn DispatchPolicy>,
        approvals: Arc<dyn ApprovalTimeoutPolicy>,
    ) -> Self {
        Self {
            router,
            backend,
            dispatch,
            approvals,
        }
    }

    /// Run one reconciliation pass.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let snapshot = match self.router.store().list_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                report.fail(None, "scan", &e.into());
                return report;
            }
        };

        self.reconcile_cancellations(&snapshot, &mut report);
        self.dispatch_queued(&snapshot, &mut report);
        self.expire_approvals(&snapshot, &mut report);

        if !report.is_idle() {
            tracing::info!(
                canceled = report.canceled,
                awaiting_stop = report.awaiting_stop,
                dispatched = report.dispatched,
                expired = report.expired,
                failures = report.failures.len(),
                "reconciliation tick"
            );
        }
        report
    }

    fn reconcile_cancellations(&self, snapshot: &[Task], report: &mut TickReport) {
        let candidates = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Running && t.has_pending_cancel());
        for task in candidates {
            match self.reconcile_cancel(task.id) {
                Ok(CancelStep::Canceled) => report.canceled += 1,
                Ok(CancelStep::AwaitingStop) => report.awaiting_stop += 1,
                Ok(CancelStep::Skipped) => {}
                Err(e) => report.fail(Some(task.id), "cancel", &e),
            }
        }
    }

    fn reconcile_cancel(&self, task_id: Uuid) -> Result<CancelStep, ControlError> {
        self.router.locks().with_lock(task_id, || {
            let task = self.router.load_task(task_id)?;
            let Some(control) = task.requested_control.clone() else {
                return Ok(CancelStep::Skipped);
            };
            if task.status != TaskStatus::Running || !task.has_pending_cancel() {
                return Ok(CancelStep::Skipped);
            }

            if !self.backend.confirm_stopped(&task)? {
                self.backend.request_stop(&task)?;
                return Ok(CancelStep::AwaitingStop);
            }

            let mut next = task.clone();
            next.transition(TaskStatus::Canceled)?;
            next.requested_control = None;
            next.status_reason = Some(control.reason.clone());

            let event = NewEvent::for_task(task_id, EventType::TaskCanceled).with_payload(json!({
                "from": task.status,
                "requested_by": control.requested_by,
                "reason": control.reason,
                "requested_at": control.requested_at,
            }));
            self.router.commit_task(Some(&task), &next, event)?;
            tracing::info!(task_id = %task_id, "deferred cancel confirmed");
            Ok(CancelStep::Canceled)
        })
    }

    fn dispatch_queued(&self, snapshot: &[Task], report: &mut TickReport) {
        let mut running = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
            .saturating_sub(report.canceled);

        let mut queued: Vec<&Task> = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Queued && is_dispatchable(t))
            .collect();
        queued.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        for task in queued {
            if !self.dispatch.may_dispatch(task, running) {
                continue;
            }
            match self.dispatch_one(task.id) {
                Ok(true) => {
                    report.dispatched += 1;
                    running += 1;
                }
                Ok(false) => {}
                Err(e) => report.fail(Some(task.id), "dispatch", &e),
            }
        }
    }

    fn dispatch_one(&self, task_id: Uuid) -> Result<bool, ControlError> {
        self.router.locks().with_lock(task_id, || {
            let task = self.router.load_task(task_id)?;
            if task.status != TaskStatus::Queued || !is_dispatchable(&task) {
                return Ok(false);
            }

            // Commit before handing the task out: the backend sees a task only
            // once it is durably running, and never again after that.
            let mut running = task.clone();
            running.transition(TaskStatus::Running)?;
            let event = NewEvent::for_task(task_id, EventType::TaskDispatched)
                .with_payload(json!({ "priority": task.priority }));
            self.router.commit_task(Some(&task), &running, event)?;

            if let Err(e) = self.backend.dispatch(&running) {
                self.fail_dispatch(&running, &e)?;
                return Err(e.into());
            }
            tracing::info!(task_id = %task_id, priority = %task.priority, "task dispatched");
            Ok(true)
        })
    }

    /// Mark a task whose dispatch the backend refused as failed.
    fn fail_dispatch(&self, task: &Task, err: &BackendError) -> Result<(), ControlError> {
        let mut next = task.clone();
        next.transition(TaskStatus::Failed)?;
        next.status_reason = Some(format!("dispatch failed: {}", err.0));

        let event = NewEvent::for_task(task.id, EventType::TaskFailed).with_payload(json!({
            "from": task.status,
            "to": next.status,
            "reason": next.status_reason,
        }));
        self.router.commit_task(Some(task), &next, event)?;
        tracing::warn!(task_id = %task.id, "backend refused dispatch, task failed: {}", err);
        Ok(())
    }

    fn expire_approvals(&self, snapshot: &[Task], report: &mut TickReport) {
        let now = Utc::now();
        for task in snapshot.iter().filter(|t| !t.is_terminal()) {
            let items = match self.router.store().list_approvals(task.id) {
                Ok(items) => items,
                Err(e) => {
                    report.fail(Some(task.id), "approvals", &e.into());
                    continue;
                }
            };
            for item in items
                .iter()
                .filter(|i| i.is_pending() && self.approvals.is_expired(i, now))
            {
                match self.expire_one(task.id, &item.step_id) {
                    Ok(true) => report.expired += 1,
                    Ok(false) => {}
                    Err(e) => report.fail(Some(task.id), "approvals", &e),
                }
            }
        }
    }

    fn expire_one(&self, task_id: Uuid, step_id: &str) -> Result<bool, ControlError> {
        self.router.locks().with_lock(task_id, || {
            let still_expired = self
                .router
                .store()
                .get_approval(task_id, step_id)?
                .is_some_and(|item| item.is_pending() && self.approvals.is_expired(&item, Utc::now()));
            if !still_expired {
                return Ok(false);
            }
            self.router.decide_locked(
                task_id,
                step_id,
                Decision::Rejected,
                RECONCILER_ACTOR,
                EventType::ApprovalExpired,
            )?;
            Ok(true)
        })
    }
}

/// A queued task may start once nothing is pending on it and its approval
/// gate (if any) is open.
fn is_dispatchable(task: &Task) -> bool {
    task.requested_control.is_none() && task.approval_satisfied()
}
