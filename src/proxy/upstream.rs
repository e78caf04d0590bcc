//! Upstream request preparation.
//!
//! The caller's headers pass through minus the hop-by-hop set, the caller's
//! credential, and anything the upstream must compute itself. The body
//! passes through verbatim except for the model-override rewrite.

use axum::http::HeaderMap;
use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::Value;

/// Headers never forwarded to an upstream.
const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "authorization",
    "content-length",
    "host",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-authorization",
    "proxy-connection",
    "x-backend-id",
    "x-session-id",
];

/// Headers never forwarded back to the caller; the server layer recomputes
/// framing for the possibly re-chunked body.
const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Copy the caller's headers, dropping the stripped set.
pub fn filtered_request_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, STRIPPED_REQUEST_HEADERS)
}

/// Copy an upstream response's headers for the client response.
pub fn filtered_response_headers(headers: &HeaderMap) -> HeaderMap {
    filter(headers, STRIPPED_RESPONSE_HEADERS)
}

fn filter(headers: &HeaderMap, stripped: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if !stripped.contains(&name.as_str()) {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

/// Serialize the request body, substituting the backend's model override
/// for the caller's model name when one is configured.
pub fn body_with_override(body: &Value, model_override: Option<&str>) -> Vec<u8> {
    match model_override {
        Some(name) => {
            let mut rewritten = body.clone();
            if let Some(obj) = rewritten.as_object_mut() {
                obj.insert("model".to_string(), Value::String(name.to_string()));
            }
            serde_json::to_vec(&rewritten).unwrap_or_default()
        }
        None => serde_json::to_vec(body).unwrap_or_default(),
    }
}

/// What one forwarding attempt produced when it did not commit.
#[derive(Debug)]
pub enum AttemptError {
    /// The per-attempt TTFT deadline fired before the first byte.
    Timeout,
    /// The upstream connection failed or broke before a usable response.
    Connect(String),
    /// The upstream answered with a non-2xx; kept whole so exhaustion can
    /// surface it verbatim.
    UpstreamStatus {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// A streaming upstream completed without producing any body.
    EmptyBody,
    /// A non-streaming upstream body failed JSON processing.
    Processing(String),
}

impl AttemptError {
    /// The `error_type` recorded in the request metric for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            AttemptError::Timeout => "ttft_timeout",
            AttemptError::Connect(_) => "network_error",
            AttemptError::UpstreamStatus { .. } => "upstream_error",
            AttemptError::EmptyBody => "no_response_body",
            AttemptError::Processing(_) => "non_streaming_processing_error",
        }
    }
}
