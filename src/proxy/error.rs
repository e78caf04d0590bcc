//! Caller-facing proxy errors.
//!
//! Every terminal error renders the wire shape
//! `{ "error": { "message", "type", "code" } }` with the status mapping the
//! dispatch contract defines. Forced-selection problems are 400s (an
//! explicit pin that cannot be honored is a caller error, not ours).

use crate::balancer::SelectionError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request body is not valid JSON")]
    InvalidBody,

    #[error("request body is missing the 'model' field")]
    ModelRequired,

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("model '{0}' is not allowed for this api key")]
    ModelNotAllowed(String),

    #[error("{0}")]
    ForcedSelection(SelectionError),

    #[error("no enabled backend available for model '{0}'")]
    NoBackend(String),

    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("load balancing strategy requires metrics: {0}")]
    StrategyRequiresMetrics(SelectionError),

    #[error("all backends at capacity for model '{0}'")]
    AllBackendsAtCapacity(String),

    #[error("time to first token deadline exceeded on every candidate backend")]
    TtftTimeout,

    #[error("upstream returned no response body")]
    NoResponseBody,

    #[error("upstream response could not be processed: {0}")]
    Processing(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),
}

impl ProxyError {
    fn status_type_code(&self) -> (StatusCode, &'static str, &'static str) {
        match self {
            ProxyError::InvalidBody => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "invalid_request",
            ),
            ProxyError::ModelRequired => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "model_required",
            ),
            ProxyError::Unauthorized(_) => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "invalid_api_key",
            ),
            ProxyError::ModelNotAllowed(_) => (
                StatusCode::FORBIDDEN,
                "permission_denied",
                "model_not_allowed",
            ),
            ProxyError::ForcedSelection(SelectionError::ForcedBackendDisabled { .. }) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "backend_disabled",
            ),
            ProxyError::ForcedSelection(_) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                "backend_not_found",
            ),
            ProxyError::NoBackend(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "no_backend",
            ),
            ProxyError::StoreUnavailable(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "store_unavailable",
            ),
            ProxyError::StrategyRequiresMetrics(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "strategy_requires_metrics",
            ),
            ProxyError::AllBackendsAtCapacity(_) => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_exceeded",
                "all_backends_at_capacity",
            ),
            ProxyError::TtftTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout_error",
                "ttft_timeout",
            ),
            ProxyError::NoResponseBody => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "no_response_body",
            ),
            ProxyError::Processing(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "non_streaming_processing_error",
            ),
            ProxyError::Upstream(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "service_unavailable",
                "upstream_error",
            ),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = self.status_type_code();
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": code,
            }
        });
        (status, Json(body)).into_response()
    }
}
