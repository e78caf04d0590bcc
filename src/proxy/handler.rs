//! The request dispatch state machine.
//!
//! # Flow, per request
//! ```text
//! parse body → caller auth → model allow-list → initial selection
//!   (forced header > affinity > strategy)
//! loop over candidates:
//!   acquire slot → build upstream request → TTFT deadline → dispatch
//!   success → respond (streaming commits at first byte)
//!   failure → record metric, release slot, next enabled backend in
//!             configured order, skipping tried ids
//! exhaustion → last upstream response verbatim, or synthesized error
//! ```

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::Utc;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::balancer::{SelectionError, SelectionInput};
use crate::config::schema::{BackendConfig, ModelConfig};
use crate::http::server::AppState;
use crate::limiter::SlotGuard;
use crate::metrics::{RequestMetric, RequestStatus, StreamType};
use crate::observability;
use crate::providers;
use crate::proxy::error::ProxyError;
use crate::proxy::streaming::{CommittedStream, StreamError, StreamTelemetry};
use crate::proxy::upstream::{self, AttemptError};

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match dispatch(&state, &headers, &body).await {
        Ok(response) => response,
        Err(error) => {
            tracing::debug!(error = %error, "Request terminated with error");
            error.into_response()
        }
    }
}

async fn dispatch(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProxyError> {
    let started = Instant::now();

    // 1. Body must be JSON naming a model
    let json: Value = serde_json::from_slice(body).map_err(|_| ProxyError::InvalidBody)?;
    let model_name = json
        .get("model")
        .and_then(Value::as_str)
        .ok_or(ProxyError::ModelRequired)?
        .to_string();
    let stream = json.get("stream").and_then(Value::as_bool).unwrap_or(false);

    // 2. Caller authentication
    let token = crate::auth::bearer_token(headers)
        .ok_or(ProxyError::Unauthorized("missing bearer token"))?;
    let api_key = state
        .api_keys
        .authenticate(token)
        .await
        .map_err(|e| ProxyError::StoreUnavailable(e.to_string()))?
        .ok_or(ProxyError::Unauthorized("invalid api key"))?;

    // 3. Caller authorization
    if !api_key.allows_model(&model_name) {
        return Err(ProxyError::ModelNotAllowed(model_name));
    }

    // 4. Initial backend selection
    let snapshot = state.registry.snapshot();
    let model = snapshot
        .model(&model_name)
        .ok_or_else(|| ProxyError::NoBackend(model_name.clone()))?;

    let force_backend_id = header_str(headers, "x-backend-id");
    let session_id = header_str(headers, "x-session-id");

    let initial = state
        .balancer
        .select(
            &model,
            SelectionInput {
                force_backend_id,
                session_id,
                is_stream: stream,
            },
        )
        .await
        .map_err(|e| match e {
            SelectionError::NoBackend { .. } => ProxyError::NoBackend(model_name.clone()),
            SelectionError::MetricsRequired { .. } => ProxyError::StrategyRequiresMetrics(e),
            _ => ProxyError::ForcedSelection(e),
        })?;

    // Forwarding loop. A forced backend is pinned: it either serves the
    // request or the request fails, never a silent substitution.
    let forced = force_backend_id.is_some();
    let mut tried: Vec<String> = Vec::new();
    let mut candidate = Some(initial);
    let mut last_failure: Option<AttemptError> = None;

    while let Some(backend) = candidate.take() {
        tried.push(backend.id.clone());
        let request_id = Uuid::new_v4().to_string();

        // Acquire a concurrency slot; denial advances, no metric
        if !state.limiter.try_acquire(&backend, &request_id).await {
            tracing::debug!(
                backend_id = %backend.id,
                model = %model.model,
                "Backend at capacity, advancing to next candidate"
            );
            candidate = if forced { None } else { next_candidate(&model, &tried) };
            continue;
        }
        let guard = SlotGuard::new(state.limiter.clone(), backend.id.clone(), request_id.clone());

        if backend.record_requests {
            tracing::info!(
                target: "audit",
                model = %model.model,
                backend_id = %backend.id,
                request_id = %request_id,
                api_key = %api_key.description,
                stream,
                "Dispatching recorded request"
            );
        }

        // Remaining per-attempt TTFT budget, measured from request start
        let deadline = match backend.ttft_timeout(stream) {
            None => None,
            Some(configured) => {
                let elapsed = started.elapsed();
                if elapsed >= configured {
                    // earlier attempts consumed the whole budget
                    record_failure(state, &model, &backend, &request_id, started, stream, "ttft_timeout");
                    guard.release().await;
                    last_failure = Some(AttemptError::Timeout);
                    candidate = if forced { None } else { next_candidate(&model, &tried) };
                    continue;
                }
                Some(configured - elapsed)
            }
        };

        // Prepare the upstream request
        let upstream_body = upstream::body_with_override(&json, backend.model_override.as_deref());
        let upstream_model = backend.model_override.as_deref().unwrap_or(&model_name);
        let request = match providers::chat_completions_request(
            &state.http,
            &backend.provider_config,
            upstream::filtered_request_headers(headers),
            upstream_body,
            upstream_model,
            stream,
        ) {
            Ok(request) => request,
            Err(e) => {
                record_failure(state, &model, &backend, &request_id, started, stream, "network_error");
                guard.release().await;
                last_failure = Some(AttemptError::Connect(e.to_string()));
                candidate = if forced { None } else { next_candidate(&model, &tried) };
                continue;
            }
        };

        // Dispatch
        if stream {
            match with_deadline(deadline, open_stream(request)).await {
                Ok((status, resp_headers, first, rest)) => {
                    // Commit point: the first upstream byte is in hand.
                    let ttft_ms = started.elapsed().as_millis() as u64;
                    observability::record_ttft(&model.model, &backend.id, true, ttft_ms);
                    write_affinity(state, &model, session_id, force_backend_id, &backend.id);

                    let telemetry = StreamTelemetry {
                        metrics: state.metrics.clone(),
                        backend_id: backend.id.clone(),
                        instance_id: state.instance.to_string(),
                        request_id,
                        model: model.model.clone(),
                        ttft_ms,
                        started,
                    };
                    let body = Body::from_stream(CommittedStream::new(first, rest, guard, telemetry));
                    return Ok(respond(status, &resp_headers, body));
                }
                Err(failure) => {
                    record_failure(
                        state, &model, &backend, &request_id, started, stream,
                        failure.error_type(),
                    );
                    guard.release().await;
                    last_failure = Some(failure);
                }
            }
        } else {
            match with_deadline(deadline, fetch_buffered(request)).await {
                Ok((status, resp_headers, response_body)) => {
                    // Success terminal: for non-streaming, TTFT is the
                    // total duration
                    let duration_ms = started.elapsed().as_millis() as u64;
                    observability::record_ttft(&model.model, &backend.id, false, duration_ms);
                    observability::record_completion(
                        &model.model,
                        &backend.id,
                        RequestStatus::Success,
                        duration_ms,
                    );
                    write_affinity(state, &model, session_id, force_backend_id, &backend.id);
                    spawn_metric(
                        state,
                        RequestMetric {
                            backend_id: backend.id.clone(),
                            instance_id: state.instance.to_string(),
                            request_id,
                            model: model.model.clone(),
                            timestamp: Utc::now(),
                            status: RequestStatus::Success,
                            duration_ms,
                            ttft_ms: Some(duration_ms),
                            stream_type: Some(StreamType::NonStreaming),
                            error_type: None,
                        },
                    );
                    guard.release().await;
                    return Ok(respond(status, &resp_headers, Body::from(response_body)));
                }
                Err(failure) => {
                    record_failure(
                        state, &model, &backend, &request_id, started, stream,
                        failure.error_type(),
                    );
                    guard.release().await;
                    last_failure = Some(failure);
                }
            }
        }

        // Next enabled candidate in configured order
        if !forced {
            candidate = next_candidate(&model, &tried);
        }
    }

    // Exhaustion
    match last_failure {
        Some(AttemptError::UpstreamStatus {
            status,
            headers,
            body,
        }) => {
            // surface upstream diagnostics verbatim
            Ok(respond(status, &headers, Body::from(body)))
        }
        Some(AttemptError::Timeout) => Err(ProxyError::TtftTimeout),
        Some(AttemptError::EmptyBody) => Err(ProxyError::NoResponseBody),
        Some(AttemptError::Processing(msg)) => Err(ProxyError::Processing(msg)),
        Some(AttemptError::Connect(msg)) => Err(ProxyError::Upstream(msg)),
        // the loop only exits without a failure when every candidate was
        // denied a slot
        None => Err(ProxyError::AllBackendsAtCapacity(model_name)),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// First enabled backend, in configured order, that has not been tried.
fn next_candidate(model: &ModelConfig, tried: &[String]) -> Option<BackendConfig> {
    model
        .enabled_backends()
        .find(|b| !tried.iter().any(|t| t == &b.id))
        .cloned()
}

async fn with_deadline<T>(
    deadline: Option<Duration>,
    attempt: impl std::future::Future<Output = Result<T, AttemptError>>,
) -> Result<T, AttemptError> {
    match deadline {
        Some(remaining) => tokio::time::timeout(remaining, attempt)
            .await
            .map_err(|_| AttemptError::Timeout)?,
        None => attempt.await,
    }
}

type OpenedStream = (
    StatusCode,
    HeaderMap,
    Bytes,
    futures_util::stream::BoxStream<'static, Result<Bytes, StreamError>>,
);

/// Send and wait for the first body byte. A non-2xx or an empty body is an
/// attempt failure, not a commit.
async fn open_stream(request: reqwest::RequestBuilder) -> Result<OpenedStream, AttemptError> {
    let response = request
        .send()
        .await
        .map_err(|e| AttemptError::Connect(e.to_string()))?;
    let status = response.status();
    let resp_headers = response.headers().clone();

    if !status.is_success() {
        let body = response.bytes().await.unwrap_or_default();
        return Err(AttemptError::UpstreamStatus {
            status,
            headers: resp_headers,
            body,
        });
    }

    let mut stream = response
        .bytes_stream()
        .map_err(|e| Box::new(e) as StreamError)
        .boxed();
    match stream.next().await {
        Some(Ok(first)) => Ok((status, resp_headers, first, stream)),
        Some(Err(e)) => Err(AttemptError::Connect(e.to_string())),
        None => Err(AttemptError::EmptyBody),
    }
}

/// Send and read the whole body. The body must be JSON; anything else is a
/// processing failure that triggers fallback.
async fn fetch_buffered(
    request: reqwest::RequestBuilder,
) -> Result<(StatusCode, HeaderMap, Bytes), AttemptError> {
    let response = request
        .send()
        .await
        .map_err(|e| AttemptError::Connect(e.to_string()))?;
    let status = response.status();
    let resp_headers = response.headers().clone();
    let body = response
        .bytes()
        .await
        .map_err(|e| AttemptError::Connect(e.to_string()))?;

    if !status.is_success() {
        return Err(AttemptError::UpstreamStatus {
            status,
            headers: resp_headers,
            body,
        });
    }

    serde_json::from_slice::<Value>(&body)
        .map_err(|e| AttemptError::Processing(e.to_string()))?;

    Ok((status, resp_headers, body))
}

fn respond(status: StatusCode, headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .extend(upstream::filtered_response_headers(headers));
    response
}

/// Store the session → backend mapping after a successful dispatch, when
/// the model's policy asks for it. Forced pins are never recorded.
fn write_affinity(
    state: &AppState,
    model: &ModelConfig,
    session_id: Option<&str>,
    force_backend_id: Option<&str>,
    backend_id: &str,
) {
    if force_backend_id.is_some() || !model.enable_affinity || !model.affinity_write_on_dispatch {
        return;
    }
    if let Some(session_id) = session_id {
        state
            .affinity
            .set_affinity_backend(&model.model, session_id, backend_id);
    }
}

fn spawn_metric(state: &AppState, metric: RequestMetric) {
    let collector = state.metrics.clone();
    tokio::spawn(async move {
        collector.record_request_complete(metric).await;
    });
}

fn record_failure(
    state: &AppState,
    model: &ModelConfig,
    backend: &BackendConfig,
    request_id: &str,
    started: Instant,
    stream: bool,
    error_type: &str,
) {
    let duration_ms = started.elapsed().as_millis() as u64;
    observability::record_completion(&model.model, &backend.id, RequestStatus::Failure, duration_ms);
    spawn_metric(
        state,
        RequestMetric {
            backend_id: backend.id.clone(),
            instance_id: state.instance.to_string(),
            request_id: request_id.to_string(),
            model: model.model.clone(),
            timestamp: Utc::now(),
            status: RequestStatus::Failure,
            duration_ms,
            ttft_ms: None,
            stream_type: Some(if stream {
                StreamType::Streaming
            } else {
                StreamType::NonStreaming
            }),
            error_type: Some(error_type.to_string()),
        },
    );
}
