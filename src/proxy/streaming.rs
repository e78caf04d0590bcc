//! Committed streaming response forwarding.
//!
//! Once the first upstream byte is in hand the backend is committed: no
//! fallback can happen, and whatever ends this stream must record exactly
//! one terminal metric and give the concurrency slot back exactly once.
//! The finisher owns both duties and fires on whichever end arrives first;
//! dropping the stream mid-flight counts as a client disconnect.

use crate::limiter::SlotGuard;
use crate::metrics::{MetricsCollector, RequestMetric, RequestStatus, StreamType};
use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

/// Chunk error produced by the upstream byte stream.
pub type StreamError = Box<dyn std::error::Error + Send + Sync>;

/// Identity of the committed attempt, carried into the terminal metric.
pub struct StreamTelemetry {
    pub metrics: Arc<dyn MetricsCollector>,
    pub backend_id: String,
    pub instance_id: String,
    pub request_id: String,
    pub model: String,
    pub ttft_ms: u64,
    pub started: Instant,
}

struct Finisher {
    guard: SlotGuard,
    telemetry: StreamTelemetry,
}

impl Finisher {
    fn finish(self, status: RequestStatus, error_type: Option<&'static str>) {
        let Finisher { guard, telemetry } = self;
        let duration_ms = telemetry.started.elapsed().as_millis() as u64;
        crate::observability::record_completion(
            &telemetry.model,
            &telemetry.backend_id,
            status,
            duration_ms,
        );
        let metric = RequestMetric {
            backend_id: telemetry.backend_id,
            instance_id: telemetry.instance_id,
            request_id: telemetry.request_id,
            model: telemetry.model,
            timestamp: Utc::now(),
            status,
            duration_ms,
            ttft_ms: Some(telemetry.ttft_ms),
            stream_type: Some(StreamType::Streaming),
            error_type: error_type.map(String::from),
        };
        let metrics = telemetry.metrics;
        tokio::spawn(async move {
            metrics.record_request_complete(metric).await;
            guard.release().await;
        });
    }
}

/// Upstream byte stream with the already-read first chunk re-attached and
/// the terminal bookkeeping wired in.
pub struct CommittedStream {
    first: Option<Bytes>,
    inner: BoxStream<'static, Result<Bytes, StreamError>>,
    finisher: Option<Finisher>,
}

impl CommittedStream {
    pub fn new(
        first: Bytes,
        inner: BoxStream<'static, Result<Bytes, StreamError>>,
        guard: SlotGuard,
        telemetry: StreamTelemetry,
    ) -> Self {
        Self {
            first: Some(first),
            inner,
            finisher: Some(Finisher { guard, telemetry }),
        }
    }
}

impl Stream for CommittedStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(first) = self.first.take() {
            return Poll::Ready(Some(Ok(first)));
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "Upstream stream broke after commit");
                if let Some(finisher) = self.finisher.take() {
                    finisher.finish(RequestStatus::Failure, Some("stream_interrupted"));
                }
                // the client stream simply ends; the prefix was already
                // delivered and must not be retried elsewhere
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                if let Some(finisher) = self.finisher.take() {
                    finisher.finish(RequestStatus::Success, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CommittedStream {
    fn drop(&mut self) {
        if let Some(finisher) = self.finisher.take() {
            finisher.finish(RequestStatus::Failure, Some("client_disconnect"));
        }
    }
}
