//! # acp-control
//!
//! The task control plane: the command router and the reconciliation loop.
//!
//! [`ControlRouter`] is the synchronous entry point for create/control/query
//! operations. [`Reconciler`] finishes the transitions that cannot complete
//! inside a request (deferred cancels, dispatch, approval expiry). Both share
//! one [`acp_task::TaskStore`], one [`acp_events::EventLog`] and one
//! [`TaskLocks`] map, so every mutation of a task is serialized per task id.
//!
//! The crate is synchronous; the daemon runs it on tokio's blocking pool and
//! drives [`Reconciler::tick`] from a timer.

pub mod backend;
pub mod config;
pub mod error;
pub mod locks;
pub mod reconcile;
pub mod router;

pub use backend::{
    ApprovalTimeoutPolicy, BackendError, DispatchPolicy, ExecutionBackend, ExpireAfter,
    MaxRunning, NeverExpire, NoopBackend,
};
pub use config::{ControlConfig, ControlPlane};
pub use error::ControlError;
pub use locks::TaskLocks;
pub use reconcile::{Reconciler, TickFailure, TickReport, RECONCILER_ACTOR};
pub use router::{ControlRequest, ControlRouter, TaskOutcome};
