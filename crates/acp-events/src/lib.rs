//! # acp-events
//!
//! Append-only event log for the agent control plane.
//!
//! Every state-changing operation (task created, control applied, dispatch,
//! cancellation, approval decisions, step reports) is recorded as one
//! [`Event`] with a strictly increasing `seq`. Observers read the log with
//! [`EventLog::tail`]; the task and approval rows are materialized views that
//! stay consistent with replaying these events in `seq` order.
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use acp_events::{EventLog, EventType, JsonlEventLog, NewEvent};
//!
//! let log = JsonlEventLog::open("/tmp/events.jsonl").unwrap();
//! let event = log
//!     .append(NewEvent::new(EventType::TaskCreated).with_payload(serde_json::json!({"goal": "fix bug"})))
//!     .unwrap();
//! assert_eq!(log.tail(event.seq - 1, 10).unwrap().len(), 1);
//! ```

pub mod error;
pub mod event;
pub mod log;

pub use error::EventLogError;
pub use event::{Event, EventType, NewEvent};
pub use log::{EventLog, JsonlEventLog, MemoryEventLog};
