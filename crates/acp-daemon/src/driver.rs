//! Timer that drives the reconciliation loop.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use acp_control::Reconciler;

/// Tick `reconciler` every `period` until `shutdown` flips to true (or its
/// sender is dropped). A tick in flight always finishes; slow ticks skip
/// the missed periods instead of bursting.
pub fn spawn(
    reconciler: Reconciler,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(period_ms = period.as_millis() as u64, "reconciliation loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let r = reconciler.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || r.tick()).await {
                        tracing::error!("reconciliation tick aborted: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("reconciliation loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    use acp_control::{ControlConfig, ControlPlane, ControlRequest, NoopBackend};
    use acp_task::{ControlAction, NewTask, TaskStatus};
    use tempfile::tempdir;
    use uuid::Uuid;

    async fn wait_for(plane: &ControlPlane, id: Uuid, status: TaskStatus) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if plane.router.get_task(id).unwrap().status == status {
                return;
            }
            assert!(Instant::now() < deadline, "task never reached {}", status);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn running_task_is_eventually_canceled() {
        let dir = tempdir().unwrap();
        let plane = ControlPlane::open(&ControlConfig::for_data_dir(dir.path()), Arc::new(NoopBackend))
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = spawn(plane.reconciler.clone(), Duration::from_millis(250), rx);

        let task = plane.router.create_task(NewTask::new("g", "/r")).unwrap();
        wait_for(&plane, task.id, TaskStatus::Running).await;

        let pending = plane
            .router
            .apply_control(task.id, ControlRequest::new(ControlAction::Cancel, "lead", "stop"))
            .unwrap();
        assert_eq!(pending.status, TaskStatus::Running);
        assert!(pending.has_pending_cancel());

        wait_for(&plane, task.id, TaskStatus::Canceled).await;
        let done = plane.router.get_task(task.id).unwrap();
        assert!(done.requested_control.is_none());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn dropping_the_sender_stops_the_loop() {
        let dir = tempdir().unwrap();
        let plane = ControlPlane::open(&ControlConfig::for_data_dir(dir.path()), Arc::new(NoopBackend))
            .unwrap();
        let (tx, rx) = watch::channel(false);
        let handle = spawn(plane.reconciler.clone(), Duration::from_millis(50), rx);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
