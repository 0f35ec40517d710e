// approval.rs: ApprovalItem: a decision gating one step of a task's plan.
//
// A step with no stored item is implicitly pending. Once a decision leaves
// pending it never changes again; re-recording the same decision is a no-op.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

const MAX_STEP_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Pending => "pending",
            Decision::Approved => "approved",
            Decision::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Step ids become store keys, so they are restricted to a safe alphabet.
pub fn validate_step_id(step_id: &str) -> Result<(), TaskError> {
    if step_id.is_empty() || step_id.len() > MAX_STEP_ID_LEN {
        return Err(TaskError::Validation(format!(
            "step id must be 1..={} characters",
            MAX_STEP_ID_LEN
        )));
    }
    if step_id.starts_with('.')
        || !step_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(TaskError::Validation(format!(
            "step id '{}' may only contain [A-Za-z0-9._-] and must not start with '.'",
            step_id
        )));
    }
    Ok(())
}

/// One approval gate for one step of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalItem {
    pub task_id: Uuid,
    pub step_id: String,
    pub decision: Decision,
    /// When the gate was registered. Drives approval expiry.
    #[serde(default)]
    pub requested_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalItem {
    /// A freshly registered pending gate.
    pub fn pending(task_id: Uuid, step_id: impl Into<String>) -> Self {
        Self {
            task_id,
            step_id: step_id.into(),
            decision: Decision::Pending,
            requested_at: Some(Utc::now()),
            decided_by: None,
            decided_at: None,
        }
    }

    /// Record a final decision.
    ///
    /// Returns `Ok(true)` when the item changed, `Ok(false)` when the same
    /// decision was already stored, and `DecisionConflict` when a different
    /// final decision exists.
    pub fn decide(
        &mut self,
        decision: Decision,
        decided_by: impl Into<String>,
    ) -> Result<bool, TaskError> {
        if decision == Decision::Pending {
            return Err(TaskError::Validation(
                "a decision must be approved or rejected".into(),
            ));
        }
        match self.decision {
            Decision::Pending => {
                self.decision = decision;
                self.decided_by = Some(decided_by.into());
                self.decided_at = Some(Utc::now());
                Ok(true)
            }
            existing if existing == decision => Ok(false),
            existing => Err(TaskError::DecisionConflict {
                task_id: self.task_id,
                step_id: self.step_id.clone(),
                existing: existing.to_string(),
                requested: decision.to_string(),
            }),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_item_can_be_decided_once() {
        let mut item = ApprovalItem::pending(Uuid::new_v4(), "plan-1");
        assert!(item.decide(Decision::Approved, "lead").unwrap());
        assert_eq!(item.decision, Decision::Approved);
        assert_eq!(item.decided_by.as_deref(), Some("lead"));
        assert!(item.decided_at.is_some());
    }

    #[test]
    fn same_decision_twice_is_noop() {
        let mut item = ApprovalItem::pending(Uuid::new_v4(), "plan-1");
        item.decide(Decision::Rejected, "lead").unwrap();
        let decided_at = item.decided_at;
        assert!(!item.decide(Decision::Rejected, "someone-else").unwrap());
        assert_eq!(item.decided_by.as_deref(), Some("lead"));
        assert_eq!(item.decided_at, decided_at);
    }

    #[test]
    fn contradictory_decision_conflicts() {
        let mut item = ApprovalItem::pending(Uuid::new_v4(), "plan-1");
        item.decide(Decision::Approved, "lead").unwrap();
        let err = item.decide(Decision::Rejected, "lead").unwrap_err();
        assert!(matches!(err, TaskError::DecisionConflict { .. }));
        assert_eq!(item.decision, Decision::Approved);
    }

    #[test]
    fn recording_pending_is_invalid() {
        let mut item = ApprovalItem::pending(Uuid::new_v4(), "s");
        assert!(matches!(
            item.decide(Decision::Pending, "x"),
            Err(TaskError::Validation(_))
        ));
    }

    #[test]
    fn step_id_alphabet() {
        assert!(validate_step_id("step-1.b_2").is_ok());
        assert!(validate_step_id("").is_err());
        assert!(validate_step_id("../etc").is_err());
        assert!(validate_step_id("a/b").is_err());
        assert!(validate_step_id(".hidden").is_err());
        assert!(validate_step_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn decision_wire_form_is_the_state_name() {
        let d: Decision = serde_json::from_str("\"approved\"").unwrap();
        assert_eq!(d, Decision::Approved);
        assert!(serde_json::from_str::<Decision>("\"approve\"").is_err());
    }
}
