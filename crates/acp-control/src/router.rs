// router.rs: ControlRouter: the only synchronous writer of tasks and ledgers.
//
// Every operation that touches a task runs under that task's lock, re-reads
// the row, decides, and commits. Commit order is fixed: the row is written
// first, then its event is appended. If the append fails the row is put back
// the way it was, so an event never describes a change that isn't in the
// store and a committed change is never left without its event.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use acp_events::{Event, EventLog, EventType, NewEvent};
use acp_task::{
    validate_step_id, ApprovalItem, ControlAction, Decision, NewTask, ProgressLedger,
    ProgressSummary, RequestedControl, StepOutcome, Task, TaskStatus, TaskStore,
};

use crate::error::ControlError;
use crate::locks::TaskLocks;

/// A control command as received from a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    #[serde(default)]
    pub requested_by: String,
    #[serde(default)]
    pub reason: String,
}

impl ControlRequest {
    pub fn new(
        action: ControlAction,
        requested_by: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action,
            requested_by: requested_by.into(),
            reason: reason.into(),
        }
    }
}

/// Execution-side completion signal for a running task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// What a control command resolves to, decided before anything is written.
enum Plan {
    /// Nothing changes; return the task as it is.
    NoOp(&'static str),
    /// Record the request on the task and let the loop finish it.
    Defer(Task),
    /// Apply the change now.
    Apply(Task),
    /// No transition exists for this command.
    Invalid(ControlError),
}

/// Accepts create/control/query operations and applies them to the task
/// registry, the approval ledger and the progress ledger.
///
/// Cloning is cheap: all state lives behind the shared store, log and locks.
#[derive(Clone)]
pub struct ControlRouter {
    store: Arc<dyn TaskStore>,
    events: Arc<dyn EventLog>,
    locks: Arc<TaskLocks>,
}

impl ControlRouter {
    pub fn new(store: Arc<dyn TaskStore>, events: Arc<dyn EventLog>) -> Self {
        Self {
            store,
            events,
            locks: Arc::new(TaskLocks::new()),
        }
    }

    pub(crate) fn store(&self) -> &dyn TaskStore {
        self.store.as_ref()
    }

    pub(crate) fn locks(&self) -> &TaskLocks {
        &self.locks
    }

    /// Validate, persist a queued task and record `task_created`.
    pub fn create_task(&self, new_task: NewTask) -> Result<Task, ControlError> {
        let task = Task::new(new_task)?;
        let event = NewEvent::for_task(task.id, EventType::TaskCreated).with_payload(json!({
            "goal": task.goal,
            "repo": task.repo,
            "branch": task.branch,
            "priority": task.priority,
            "risk_profile": task.risk_profile,
            "requires_approval": task.requires_approval,
        }));

        self.locks
            .with_lock(task.id, || self.commit_task(None, &task, event))?;

        tracing::info!(task_id = %task.id, repo = %task.repo, priority = %task.priority, "task created");
        Ok(task)
    }

    /// Read a task.
    pub fn get_task(&self, task_id: Uuid) -> Result<Task, ControlError> {
        self.load_task(task_id)
    }

    /// List tasks (newest first), optionally filtered by status.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, ControlError> {
        let tasks = match status {
            Some(status) => self.store.list_tasks_by_status(status)?,
            None => self.store.list_tasks()?,
        };
        Ok(tasks)
    }

    /// Apply a control command.
    ///
    /// Appends `control_requested` for every command against a known task.
    /// Commands against terminal tasks return the task unchanged. A cancel
    /// against a running task is recorded in `requested_control` and finished
    /// by the reconciliation loop; everything else applies immediately and
    /// appends `control_applied`.
    pub fn apply_control(
        &self,
        task_id: Uuid,
        request: ControlRequest,
    ) -> Result<Task, ControlError> {
        self.locks.with_lock(task_id, || {
            let task = self.load_task(task_id)?;
            let requested = NewEvent::for_task(task_id, EventType::ControlRequested).with_payload(
                json!({
                    "action": request.action,
                    "requested_by": request.requested_by,
                    "reason": request.reason,
                    "status": task.status,
                }),
            );

            match plan_control(&task, &request) {
                Plan::NoOp(why) => {
                    self.events.append(requested)?;
                    tracing::debug!(task_id = %task_id, action = %request.action, status = %task.status, "control no-op: {}", why);
                    Ok(task)
                }
                Plan::Defer(next) => {
                    self.commit_task(Some(&task), &next, requested)?;
                    tracing::info!(task_id = %task_id, action = %request.action, requested_by = %request.requested_by, "control deferred to reconciliation");
                    Ok(next)
                }
                Plan::Apply(next) => {
                    self.events.append(requested)?;
                    let applied = NewEvent::for_task(task_id, EventType::ControlApplied)
                        .with_payload(json!({
                            "action": request.action,
                            "requested_by": request.requested_by,
                            "reason": request.reason,
                            "from": task.status,
                            "to": next.status,
                        }));
                    self.commit_task(Some(&task), &next, applied)?;
                    tracing::info!(task_id = %task_id, action = %request.action, from = %task.status, to = %next.status, "control applied");
                    Ok(next)
                }
                Plan::Invalid(err) => {
                    self.events.append(requested)?;
                    Err(err)
                }
            }
        })
    }

    /// Record the execution side's completion signal for a running task.
    ///
    /// Completion wins over a pending cancel: whichever terminal transition
    /// commits first is final.
    pub fn complete_task(
        &self,
        task_id: Uuid,
        outcome: TaskOutcome,
        reason: Option<String>,
    ) -> Result<Task, ControlError> {
        self.locks.with_lock(task_id, || {
            let task = self.load_task(task_id)?;
            if task.is_terminal() {
                return Ok(task);
            }

            let (status, event_type) = match outcome {
                TaskOutcome::Success => (TaskStatus::Completed, EventType::TaskCompleted),
                TaskOutcome::Failure => (TaskStatus::Failed, EventType::TaskFailed),
            };
            let mut next = task.clone();
            next.transition(status)?;
            next.requested_control = None;
            next.status_reason = reason;

            let event = NewEvent::for_task(task_id, event_type).with_payload(json!({
                "from": task.status,
                "to": next.status,
                "reason": next.status_reason,
            }));
            self.commit_task(Some(&task), &next, event)?;
            tracing::info!(task_id = %task_id, status = %next.status, "task finished");
            Ok(next)
        })
    }

    /// Register a pending approval gate for a step. Idempotent.
    pub fn request_approval(
        &self,
        task_id: Uuid,
        step_id: &str,
    ) -> Result<ApprovalItem, ControlError> {
        validate_step_id(step_id)?;
        self.locks.with_lock(task_id, || {
            let task = self.load_task(task_id)?;
            if let Some(existing) = self.store.get_approval(task_id, step_id)? {
                return Ok(existing);
            }
            if task.is_terminal() {
                return Err(ControlError::Validation(format!(
                    "task {} is {}; no new approval gates",
                    task_id, task.status
                )));
            }

            let item = ApprovalItem::pending(task_id, step_id);
            self.store.put_approval(&item)?;
            let event = NewEvent::for_task(task_id, EventType::ApprovalRequested)
                .with_payload(json!({ "step_id": step_id }));
            if let Err(e) = self.events.append(event) {
                self.rollback(|| self.store.remove_approval(task_id, step_id));
                return Err(e.into());
            }
            Ok(item)
        })
    }

    /// Record an approve/reject decision for a step.
    ///
    /// Re-recording the same decision is a no-op; a different decision for an
    /// already decided step is a `Conflict`. A rejection also lands in the
    /// progress ledger's `rejected` set.
    pub fn record_decision(
        &self,
        task_id: Uuid,
        step_id: &str,
        decision: Decision,
        decided_by: &str,
    ) -> Result<ApprovalItem, ControlError> {
        validate_step_id(step_id)?;
        self.locks.with_lock(task_id, || {
            self.load_task(task_id)?;
            self.decide_locked(
                task_id,
                step_id,
                decision,
                decided_by,
                EventType::ApprovalRecorded,
            )
        })
    }

    /// The decision for a step; `pending` when nothing was recorded.
    pub fn get_decision(&self, task_id: Uuid, step_id: &str) -> Result<Decision, ControlError> {
        validate_step_id(step_id)?;
        self.load_task(task_id)?;
        Ok(self
            .store
            .get_approval(task_id, step_id)?
            .map(|item| item.decision)
            .unwrap_or_default())
    }

    /// All approval items registered or decided for a task.
    pub fn list_approvals(&self, task_id: Uuid) -> Result<Vec<ApprovalItem>, ControlError> {
        self.load_task(task_id)?;
        Ok(self.store.list_approvals(task_id)?)
    }

    /// Record an execution-side step outcome in the progress ledger.
    pub fn report_step(
        &self,
        task_id: Uuid,
        step_id: &str,
        outcome: StepOutcome,
    ) -> Result<ProgressLedger, ControlError> {
        validate_step_id(step_id)?;
        self.locks.with_lock(task_id, || {
            self.load_task(task_id)?;
            let before = self.store.get_progress(task_id)?;
            let mut ledger = before.clone();
            if !ledger.record(outcome, step_id) {
                return Ok(ledger);
            }

            self.store.put_progress(&ledger)?;
            let event = NewEvent::for_task(task_id, EventType::StepReported)
                .with_payload(json!({ "step_id": step_id, "outcome": outcome }));
            if let Err(e) = self.events.append(event) {
                self.rollback(|| self.store.put_progress(&before));
                return Err(e.into());
            }
            Ok(ledger)
        })
    }

    pub fn progress(&self, task_id: Uuid) -> Result<ProgressLedger, ControlError> {
        self.load_task(task_id)?;
        Ok(self.store.get_progress(task_id)?)
    }

    pub fn progress_summary(&self, task_id: Uuid) -> Result<ProgressSummary, ControlError> {
        Ok(self.progress(task_id)?.summary())
    }

    /// Events after `since_seq`, oldest first.
    pub fn tail_events(&self, since_seq: u64, limit: usize) -> Result<Vec<Event>, ControlError> {
        Ok(self.events.tail(since_seq, limit)?)
    }

    pub(crate) fn load_task(&self, task_id: Uuid) -> Result<Task, ControlError> {
        self.store
            .get_task(task_id)?
            .ok_or(ControlError::TaskNotFound(task_id))
    }

    /// Write `next`, then append `event`. On append failure restore `before`
    /// (or remove a newly created row). Caller holds the task lock.
    pub(crate) fn commit_task(
        &self,
        before: Option<&Task>,
        next: &Task,
        event: NewEvent,
    ) -> Result<Event, ControlError> {
        self.store.put_task(next)?;
        match self.events.append(event) {
            Ok(event) => Ok(event),
            Err(e) => {
                match before {
                    Some(before) => self.rollback(|| self.store.put_task(before)),
                    None => self.rollback(|| self.store.remove_task(next.id)),
                }
                Err(e.into())
            }
        }
    }

    /// Decide an approval item and commit it with `event_type`.
    /// Caller holds the task lock.
    pub(crate) fn decide_locked(
        &self,
        task_id: Uuid,
        step_id: &str,
        decision: Decision,
        decided_by: &str,
        event_type: EventType,
    ) -> Result<ApprovalItem, ControlError> {
        let stored = self.store.get_approval(task_id, step_id)?;
        let mut item = stored.clone().unwrap_or_else(|| ApprovalItem {
            requested_at: None,
            ..ApprovalItem::pending(task_id, step_id)
        });
        if !item.decide(decision, decided_by)? {
            return Ok(item);
        }

        let progress_before = self.store.get_progress(task_id)?;
        let mut progress = progress_before.clone();
        let progress_grew = decision == Decision::Rejected && progress.mark_rejected(step_id);

        self.store.put_approval(&item)?;
        if progress_grew {
            if let Err(e) = self.store.put_progress(&progress) {
                self.restore_approval(task_id, step_id, stored.as_ref());
                return Err(e.into());
            }
        }

        let event = NewEvent::for_task(task_id, event_type).with_payload(json!({
            "step_id": step_id,
            "decision": decision,
            "decided_by": decided_by,
        }));
        if let Err(e) = self.events.append(event) {
            self.restore_approval(task_id, step_id, stored.as_ref());
            if progress_grew {
                self.rollback(|| self.store.put_progress(&progress_before));
            }
            return Err(e.into());
        }

        tracing::info!(task_id = %task_id, step_id, decision = %decision, decided_by, "approval decided");
        Ok(item)
    }

    fn restore_approval(&self, task_id: Uuid, step_id: &str, stored: Option<&ApprovalItem>) {
        match stored {
            Some(item) => self.rollback(|| self.store.put_approval(item)),
            None => self.rollback(|| self.store.remove_approval(task_id, step_id)),
        }
    }

    /// Best-effort undo of an uncommitted write. If the undo itself fails the
    /// row may be ahead of the log until the store is repaired; that is the
    /// one case the log must be treated as authoritative.
    fn rollback(&self, undo: impl FnOnce() -> Result<(), acp_task::TaskError>) {
        if let Err(e) = undo() {
            tracing::error!("rollback after failed event append also failed: {}", e);
        }
    }
}

/// Resolve a control command against the task's current state.
fn plan_control(task: &Task, request: &ControlRequest) -> Plan {
    if task.is_terminal() {
        return Plan::NoOp("task is terminal");
    }
    if task.has_pending_cancel() {
        return Plan::NoOp("cancel already pending");
    }

    let mut next = task.clone();
    match (request.action, task.status) {
        (ControlAction::Cancel, TaskStatus::Queued) => {
            if let Err(e) = next.transition(TaskStatus::Canceled) {
                return Plan::Invalid(e.into());
            }
            next.status_reason = Some(request.reason.clone());
            Plan::Apply(next)
        }
        (ControlAction::Cancel, TaskStatus::Running) => {
            next.requested_control = Some(RequestedControl {
                action: ControlAction::Cancel,
                requested_by: request.requested_by.clone(),
                reason: request.reason.clone(),
                requested_at: chrono::Utc::now(),
            });
            next.touch();
            Plan::Defer(next)
        }
        (ControlAction::Reject, _) => match next.transition(TaskStatus::Rejected) {
            Ok(()) => {
                next.status_reason = Some(request.reason.clone());
                Plan::Apply(next)
            }
            Err(e) => Plan::Invalid(e.into()),
        },
        (ControlAction::Approve, TaskStatus::Queued)
            if task.requires_approval && task.approved_by.is_none() =>
        {
            next.approved_by = Some(request.requested_by.clone());
            next.touch();
            Plan::Apply(next)
        }
        (ControlAction::Approve, _) => Plan::NoOp("nothing to approve"),
        // Terminal statuses returned above.
        (ControlAction::Cancel, _) => Plan::NoOp("task is terminal"),
    }
}
