//! Relay gateway: exposes the task create/get/control routes locally and
//! forwards them verbatim to an upstream control plane.
//!
//! The relay holds no task state. Upstream answers (including errors) pass
//! through with their status and JSON body unchanged, except a `401`: that
//! refuses the relay's own upstream token, not the local caller, and becomes
//! `502 upstream_rejected`. Transport failures and non-JSON answers become
//! `502 upstream_unavailable`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, StatusCode, Uri};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::{healthz, API_PREFIX};
use crate::auth::{require_token, BearerToken};
use crate::error::ApiError;

#[derive(Clone)]
pub struct RelayState {
    client: reqwest::Client,
    upstream: Arc<str>,
    upstream_token: Arc<str>,
}

impl RelayState {
    pub fn new(upstream: &str, upstream_token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build relay HTTP client")?;
        Ok(Self {
            client,
            upstream: Arc::from(upstream.trim_end_matches('/')),
            upstream_token: Arc::from(upstream_token),
        })
    }
}

/// Build the relay's HTTP app; callers authenticate with `local_token`.
pub fn app(state: RelayState, local_token: BearerToken) -> Router {
    let forwarded = Router::new()
        .route(&format!("{}/tasks", API_PREFIX), post(forward))
        .route(&format!("{}/tasks/{{id}}", API_PREFIX), get(forward))
        .route(&format!("{}/tasks/{{id}}/control", API_PREFIX), post(forward))
        .route_layer(middleware::from_fn_with_state(local_token, require_token));

    forwarded
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn forward(
    State(state): State<RelayState>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    match relay_once(&state, method, &uri, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn relay_once(
    state: &RelayState,
    method: Method,
    uri: &Uri,
    body: Bytes,
) -> Result<Response, ApiError> {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or(uri.path());
    let url = format!("{}{}", state.upstream, path);

    let mut request = state
        .client
        .request(method.clone(), &url)
        .bearer_auth(&*state.upstream_token);
    if !body.is_empty() {
        request = request.header(CONTENT_TYPE, "application/json").body(body);
    }

    let upstream = request.send().await.map_err(|e| {
        tracing::warn!(%method, url = %url, "relay forwarding failed: {}", e);
        ApiError::Upstream(format!("upstream request failed: {}", e))
    })?;
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .map_err(|e| ApiError::Upstream(format!("upstream sent an invalid status: {}", e)))?;
    if status == StatusCode::UNAUTHORIZED {
        tracing::error!(%method, url = %url, "upstream rejected the relay's token");
        return Err(ApiError::UpstreamRejected(
            "upstream rejected the relay's credentials".into(),
        ));
    }
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| ApiError::Upstream(format!("upstream body unreadable: {}", e)))?;
    if serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
        tracing::warn!(%method, url = %url, status = status.as_u16(), "upstream answered with non-JSON body");
        return Err(ApiError::Upstream("upstream answered with a non-JSON body".into()));
    }

    tracing::debug!(%method, url = %url, status = status.as_u16(), "relayed");
    Ok((status, [(CONTENT_TYPE, "application/json")], bytes).into_response())
}
