//! HTTP API of the control plane.
//!
//! Routes live under `/agent-control-plane/v1` and require the bearer token;
//! `/healthz` is open. The router is synchronous, so every handler runs its
//! call on tokio's blocking pool.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use acp_control::{ControlError, ControlRequest, ControlRouter, TaskOutcome};
use acp_task::{Decision, NewTask, StepOutcome, TaskStatus};

use crate::auth::{require_token, BearerToken};
use crate::error::ApiError;

pub const API_PREFIX: &str = "/agent-control-plane/v1";

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub router: ControlRouter,
}

/// Build the control plane's HTTP app.
pub fn app(router: ControlRouter, token: BearerToken) -> Router {
    let api = Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/control", post(control_task))
        .route("/tasks/{id}/complete", post(complete_task))
        .route("/tasks/{id}/approvals", get(list_approvals))
        .route(
            "/tasks/{id}/approvals/{step_id}",
            post(approval).get(get_decision),
        )
        .route("/tasks/{id}/steps/{step_id}", post(report_step))
        .route("/tasks/{id}/progress", get(progress))
        .route("/events", get(tail_events))
        .route_layer(middleware::from_fn_with_state(token, require_token));

    Router::new()
        .nest(API_PREFIX, api)
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { router })
}

pub async fn healthz() -> Json<Value> {
    Json(json!({ "ok": true }))
}

/// Run a router call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ControlError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::Internal(format!("handler task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// A malformed id names no task, so it is a 404 like any unknown id.
fn parse_task_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::NotFound(format!("task not found: {}", raw)))
}

/// POST /tasks
async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<NewTask>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(new_task) = payload?;
    let router = state.router.clone();
    let task = blocking(move || router.create_task(new_task)).await?;
    Ok(Json(json!({ "ok": true, "task_id": task.id, "task": task })))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TaskStatus>,
}

/// GET /tasks?status=
async fn list_tasks(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let router = state.router.clone();
    let tasks = blocking(move || router.list_tasks(query.status)).await?;
    Ok(Json(json!({ "ok": true, "tasks": tasks })))
}

/// GET /tasks/{id}
async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let router = state.router.clone();
    let task = blocking(move || router.get_task(id)).await?;
    Ok(Json(json!({ "ok": true, "task": task })))
}

/// POST /tasks/{id}/control
async fn control_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ControlRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let Json(request) = payload?;
    let router = state.router.clone();
    let task = blocking(move || router.apply_control(id, request)).await?;
    Ok(Json(json!({ "ok": true, "task": task })))
}

#[derive(Debug, Deserialize)]
struct CompleteBody {
    outcome: TaskOutcome,
    #[serde(default)]
    reason: Option<String>,
}

/// POST /tasks/{id}/complete
async fn complete_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<CompleteBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let Json(body) = payload?;
    let router = state.router.clone();
    let task = blocking(move || router.complete_task(id, body.outcome, body.reason)).await?;
    Ok(Json(json!({ "ok": true, "task": task })))
}

#[derive(Debug, Deserialize)]
struct ApprovalBody {
    #[serde(default)]
    decision: Option<Decision>,
    #[serde(default)]
    decided_by: String,
}

/// POST /tasks/{id}/approvals/{step_id}
///
/// Without a decision this opens a pending gate for the step.
async fn approval(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    payload: Result<Json<ApprovalBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let Json(body) = payload?;
    let router = state.router.clone();
    let item = match body.decision {
        None => blocking(move || router.request_approval(id, &step_id)).await?,
        Some(decision) => {
            if body.decided_by.trim().is_empty() {
                return Err(ApiError::Validation(
                    "decided_by is required with a decision".into(),
                ));
            }
            blocking(move || router.record_decision(id, &step_id, decision, &body.decided_by))
                .await?
        }
    };
    Ok(Json(json!({ "ok": true, "approval": item })))
}

/// GET /tasks/{id}/approvals
async fn list_approvals(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let router = state.router.clone();
    let approvals = blocking(move || router.list_approvals(id)).await?;
    Ok(Json(json!({ "ok": true, "approvals": approvals })))
}

/// GET /tasks/{id}/approvals/{step_id}
async fn get_decision(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let router = state.router.clone();
    let decision = blocking(move || router.get_decision(id, &step_id)).await?;
    Ok(Json(json!({ "ok": true, "decision": decision })))
}

#[derive(Debug, Deserialize)]
struct StepBody {
    outcome: StepOutcome,
}

/// POST /tasks/{id}/steps/{step_id}
async fn report_step(
    State(state): State<AppState>,
    Path((id, step_id)): Path<(String, String)>,
    payload: Result<Json<StepBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let Json(body) = payload?;
    let router = state.router.clone();
    let ledger = blocking(move || router.report_step(id, &step_id, body.outcome)).await?;
    Ok(Json(json!({ "ok": true, "progress": ledger })))
}

/// GET /tasks/{id}/progress
async fn progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = parse_task_id(&id)?;
    let router = state.router.clone();
    let ledger = blocking(move || router.progress(id)).await?;
    let summary = ledger.summary();
    Ok(Json(json!({ "ok": true, "progress": ledger, "summary": summary })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    since: u64,
    limit: Option<usize>,
}

/// GET /events?since=&limit=
async fn tail_events(
    State(state): State<AppState>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Json<Value>, ApiError> {
    let Query(query) = query?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);
    let router = state.router.clone();
    let events = blocking(move || router.tail_events(query.since, limit)).await?;
    Ok(Json(json!({ "ok": true, "events": events })))
}
