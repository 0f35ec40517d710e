//! HTTP error mapping.
//!
//! Every failure leaves the daemon as `{ok:false, error:<code>, message}`.
//! Control-plane errors keep their own code; the status code is derived
//! from it.

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use acp_control::ControlError;

#[derive(Debug)]
pub enum ApiError {
    /// Anything the router or reconciler reported.
    Control(ControlError),
    /// Malformed body, query or path input caught before the router.
    Validation(String),
    /// The path names a task id that cannot exist.
    NotFound(String),
    /// Missing or wrong bearer token.
    Unauthorized,
    /// The relay could not reach the upstream or got garbage back.
    Upstream(String),
    /// The upstream refused the relay's own credentials.
    UpstreamRejected(String),
    /// A handler task died (panic inside the blocking pool).
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Control(e) => e.code(),
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Unauthorized => "unauthorized",
            Self::Upstream(_) => "upstream_unavailable",
            Self::UpstreamRejected(_) => "upstream_rejected",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.code() {
            "validation_error" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "conflict" | "invalid_transition" => StatusCode::CONFLICT,
            "store_unavailable" | "backend_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "upstream_unavailable" | "upstream_rejected" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Control(e) => e.to_string(),
            Self::Validation(m)
            | Self::NotFound(m)
            | Self::Upstream(m)
            | Self::UpstreamRejected(m)
            | Self::Internal(m) => m.clone(),
            Self::Unauthorized => "missing or invalid bearer token".to_string(),
        }
    }
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        Self::Control(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::Validation(e.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(e: QueryRejection) -> Self {
        Self::Validation(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), "request failed: {}", self.message());
        }
        let mut body = json!({
            "ok": false,
            "error": self.code(),
            "message": self.message(),
        });
        match &self {
            Self::Upstream(_) => body["retryable"] = json!(true),
            Self::UpstreamRejected(_) => body["retryable"] = json!(false),
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn control_codes_map_to_status() {
        let cases = [
            (ControlError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ControlError::TaskNotFound(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (ControlError::Conflict("x".into()), StatusCode::CONFLICT),
            (
                ControlError::InvalidTransition {
                    task_id: Uuid::new_v4(),
                    from: "running".into(),
                    to: "rejected".into(),
                },
                StatusCode::CONFLICT,
            ),
            (ControlError::StoreUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn daemon_codes_map_to_status() {
        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::Upstream("down".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ApiError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            ApiError::UpstreamRejected("bad token".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::Internal("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn only_transport_failures_are_retryable() {
        let body = |err: ApiError| async move {
            let response = err.into_response();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap()
        };
        let json = body(ApiError::Upstream("down".into())).await;
        assert_eq!(json["error"], "upstream_unavailable");
        assert_eq!(json["retryable"], true);

        let json = body(ApiError::UpstreamRejected("bad token".into())).await;
        assert_eq!(json["error"], "upstream_rejected");
        assert_eq!(json["retryable"], false);

        let json = body(ApiError::Unauthorized).await;
        assert!(json.get("retryable").is_none());
    }
}
