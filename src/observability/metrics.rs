//! Metrics collection and exposition.

use crate::metrics::RequestStatus;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Initialize metrics exporter and server.
pub fn init_metrics(addr: SocketAddr) {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus recorder");

    tracing::info!("Metrics server listening on http://{}", addr);
}

/// Helper to record a completed proxy request.
pub fn record_completion(model: &str, backend: &str, status: RequestStatus, duration_ms: u64) {
    let status = match status {
        RequestStatus::Success => "success",
        RequestStatus::Failure => "failure",
    };
    let labels = [
        ("model", model.to_string()),
        ("backend", backend.to_string()),
        ("status", status.to_string()),
    ];

    counter!("proxy_requests_total", &labels).increment(1);
    histogram!("proxy_request_duration_seconds", &labels).record(duration_ms as f64 / 1000.0);
}

/// Helper to record time-to-first-token of a dispatched attempt.
pub fn record_ttft(model: &str, backend: &str, stream: bool, ttft_ms: u64) {
    let labels = [
        ("model", model.to_string()),
        ("backend", backend.to_string()),
        ("stream", stream.to_string()),
    ];
    histogram!("proxy_ttft_seconds", &labels).record(ttft_ms as f64 / 1000.0);
}
