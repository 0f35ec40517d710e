// event.rs: Event data model.
//
// One Event per state-changing operation. `seq` is assigned by the log at
// append time; callers build a NewEvent and never pick sequence numbers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    /// A control command was received (appended for every command).
    ControlRequested,
    /// A control command changed the task synchronously.
    ControlApplied,
    TaskDispatched,
    /// A deferred cancel was confirmed by the reconciliation loop.
    TaskCanceled,
    TaskCompleted,
    TaskFailed,
    ApprovalRequested,
    ApprovalRecorded,
    /// A pending approval timed out and was auto-rejected.
    ApprovalExpired,
    StepReported,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::TaskCreated => "task_created",
            EventType::ControlRequested => "control_requested",
            EventType::ControlApplied => "control_applied",
            EventType::TaskDispatched => "task_dispatched",
            EventType::TaskCanceled => "task_canceled",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::ApprovalRequested => "approval_requested",
            EventType::ApprovalRecorded => "approval_recorded",
            EventType::ApprovalExpired => "approval_expired",
            EventType::StepReported => "step_reported",
        };
        f.write_str(s)
    }
}

/// A recorded event: one line in the JSONL log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Position in the log, starting at 1, without gaps.
    pub seq: u64,

    /// The task this event concerns, if any.
    pub task_id: Option<Uuid>,

    #[serde(rename = "type")]
    pub event_type: EventType,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub ts: DateTime<Utc>,

    /// SHA-256 of the previous record's line. None for the first record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
}

/// An event waiting to be appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub task_id: Option<Uuid>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            task_id: None,
            event_type,
            payload: serde_json::Value::Null,
        }
    }

    /// Shorthand for an event about one task.
    pub fn for_task(task_id: Uuid, event_type: EventType) -> Self {
        Self::new(event_type).with_task(task_id)
    }

    pub fn with_task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Stamp the event with its sequence number and link.
    pub(crate) fn into_event(self, seq: u64, prev_hash: Option<String>) -> Event {
        Event {
            seq,
            task_id: self.task_id,
            event_type: self.event_type,
            payload: self.payload,
            ts: Utc::now(),
            prev_hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_field_is_named_type_and_snake_case() {
        let event = NewEvent::for_task(Uuid::new_v4(), EventType::ControlApplied)
            .with_payload(serde_json::json!({"action": "cancel"}))
            .into_event(7, None);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "control_applied");
        assert_eq!(json["seq"], 7);
        assert!(json.get("prev_hash").is_none());
    }

    #[test]
    fn display_matches_serde_name() {
        for ty in [
            EventType::TaskCreated,
            EventType::TaskDispatched,
            EventType::ApprovalExpired,
            EventType::StepReported,
        ] {
            let json = serde_json::to_string(&ty).unwrap();
            assert_eq!(json.trim_matches('"'), ty.to_string());
        }
    }

    #[test]
    fn event_without_task_serializes_null_task_id() {
        let event = NewEvent::new(EventType::TaskCreated).into_event(1, None);
        let json = serde_json::to_value(&event).unwrap();
        assert!(json["task_id"].is_null());
    }
}
