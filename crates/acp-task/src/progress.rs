// progress.rs: ProgressLedger: which steps of a task completed, failed or were rejected.
//
// The ledger only grows. Step ids move from absent to present and are never
// removed, which makes it safe to rebuild dashboards or resume work from it.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Execution-side outcome reported for a step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressLedger {
    pub task_id: Uuid,
    #[serde(default)]
    pub completed: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeSet<String>,
    #[serde(default)]
    pub rejected: BTreeSet<String>,
}

/// Read-only counts derived from a [`ProgressLedger`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressSummary {
    pub task_id: Uuid,
    pub completed: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl ProgressLedger {
    pub fn new(task_id: Uuid) -> Self {
        Self {
            task_id,
            ..Self::default()
        }
    }

    /// Add a step to the set for `outcome`. Returns true if the ledger grew.
    pub fn record(&mut self, outcome: StepOutcome, step_id: &str) -> bool {
        let set = match outcome {
            StepOutcome::Completed => &mut self.completed,
            StepOutcome::Failed => &mut self.failed,
        };
        set.insert(step_id.to_string())
    }

    /// Add a step to the rejected set. Returns true if the ledger grew.
    pub fn mark_rejected(&mut self, step_id: &str) -> bool {
        self.rejected.insert(step_id.to_string())
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary {
            task_id: self.task_id,
            completed: self.completed.len(),
            failed: self.failed.len(),
            rejected: self.rejected.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_only_grows() {
        let mut ledger = ProgressLedger::new(Uuid::new_v4());
        assert!(ledger.record(StepOutcome::Completed, "s1"));
        assert!(!ledger.record(StepOutcome::Completed, "s1"));
        assert!(ledger.record(StepOutcome::Failed, "s2"));
        assert!(ledger.mark_rejected("s3"));
        assert!(!ledger.mark_rejected("s3"));

        let summary = ledger.summary();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.rejected, 1);
    }

    #[test]
    fn missing_sets_deserialize_empty() {
        let id = Uuid::new_v4();
        let json = format!(r#"{{"task_id":"{}"}}"#, id);
        let ledger: ProgressLedger = serde_json::from_str(&json).unwrap();
        assert_eq!(ledger.task_id, id);
        assert!(ledger.completed.is_empty());
    }
}
