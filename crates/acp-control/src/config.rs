// config.rs: Control plane configuration.
//
// ControlConfig determines where the control plane keeps its state and how
// the reconciliation loop behaves. `for_data_dir()` generates the standard
// layout under one data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use acp_events::JsonlEventLog;
use acp_task::JsonFileStore;

use crate::backend::{
    ApprovalTimeoutPolicy, ExecutionBackend, ExpireAfter, MaxRunning, NeverExpire,
};
use crate::error::ControlError;
use crate::reconcile::Reconciler;
use crate::router::ControlRouter;

/// Configuration for one control-plane instance.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Directory of the durable task/approval/progress store.
    pub store_dir: PathBuf,

    /// Path to the append-only event log.
    pub events_log: PathBuf,

    /// How often the reconciliation loop ticks.
    pub reconcile_interval: Duration,

    /// Cap on concurrently running tasks (0 = unlimited).
    pub max_running: usize,

    /// Pending approvals older than this are auto-rejected. None = never.
    pub approval_timeout: Option<Duration>,
}

impl ControlConfig {
    /// Create a config with the standard layout under `data_dir`.
    pub fn for_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let root = data_dir.as_ref();
        Self {
            store_dir: root.to_path_buf(),
            events_log: root.join("events.jsonl"),
            reconcile_interval: Duration::from_millis(1000),
            max_running: 4,
            approval_timeout: None,
        }
    }

    fn approval_policy(&self) -> Result<Arc<dyn ApprovalTimeoutPolicy>, ControlError> {
        Ok(match self.approval_timeout {
            Some(timeout) => {
                let timeout = chrono::Duration::from_std(timeout).map_err(|e| {
                    ControlError::Validation(format!("approval timeout out of range: {}", e))
                })?;
                Arc::new(ExpireAfter(timeout))
            }
            None => Arc::new(NeverExpire),
        })
    }
}

/// A router and a reconciler sharing one store, event log and lock map.
#[derive(Clone)]
pub struct ControlPlane {
    pub router: ControlRouter,
    pub reconciler: Reconciler,
}

impl ControlPlane {
    /// Open the file-backed store and event log described by `config`.
    pub fn open(
        config: &ControlConfig,
        backend: Arc<dyn ExecutionBackend>,
    ) -> Result<Self, ControlError> {
        let store = JsonFileStore::new(&config.store_dir)?;
        let events = JsonlEventLog::open(&config.events_log)?;
        let router = ControlRouter::new(Arc::new(store), Arc::new(events));
        let reconciler = Reconciler::new(
            router.clone(),
            backend,
            Arc::new(MaxRunning(config.max_running)),
            config.approval_policy()?,
        );
        Ok(Self { router, reconciler })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoopBackend;
    use acp_task::{NewTask, TaskStatus};
    use tempfile::tempdir;

    #[test]
    fn standard_layout() {
        let config = ControlConfig::for_data_dir("/var/lib/acp");
        assert_eq!(config.events_log, PathBuf::from("/var/lib/acp/events.jsonl"));
        assert_eq!(config.store_dir, PathBuf::from("/var/lib/acp"));
        assert!(config.approval_timeout.is_none());
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempdir().unwrap();
        let config = ControlConfig::for_data_dir(dir.path());

        let id = {
            let plane = ControlPlane::open(&config, Arc::new(NoopBackend)).unwrap();
            let task = plane.router.create_task(NewTask::new("g", "/r")).unwrap();
            plane.reconciler.tick();
            task.id
        };

        let plane = ControlPlane::open(&config, Arc::new(NoopBackend)).unwrap();
        assert_eq!(plane.router.get_task(id).unwrap().status, TaskStatus::Running);
        let events = plane.router.tail_events(0, 100).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].seq, 2);
    }
}
