//! Request metrics store and aggregator.
//!
//! # Data Flow
//! ```text
//! Dispatcher terminal path → record_request_complete (fire-and-forget)
//!     → memory.rs (minute-aligned buckets per backend/instance)
//!     → get_stats / get_all_stats (windowed aggregates)
//!         → load balancer (lowest-ttft, min-error-rate)
//!     → get_historical_stats (minute time series)
//!         → admin stats surface
//! ```
//!
//! Appends never block the client response and a failed append never fails
//! the request; the collector logs and swallows internally.

pub mod memory;
pub mod noop;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal status of one proxied request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Success,
    Failure,
}

/// Whether the caller asked for a streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamType {
    Streaming,
    NonStreaming,
}

/// One record per completed request attempt. Immutable, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct RequestMetric {
    pub backend_id: String,
    pub instance_id: String,
    pub request_id: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub status: RequestStatus,
    pub duration_ms: u64,
    pub ttft_ms: Option<u64>,
    pub stream_type: Option<StreamType>,
    pub error_type: Option<String>,
}

/// Half-open time range over record timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// The trailing `minutes` ending now.
    pub fn last_minutes(minutes: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::minutes(minutes),
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts <= self.end
    }
}

/// Windowed aggregate for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// successful / total; 1.0 when no requests were observed, so idle
    /// backends never read as failing.
    pub success_rate: f64,
    pub average_streaming_ttft_ms: f64,
    pub average_non_streaming_ttft_ms: f64,
    /// Sample counts behind the TTFT means; zero means "no data", which
    /// the load balancer treats as cold start.
    pub streaming_ttft_samples: u64,
    pub non_streaming_ttft_samples: u64,
}

impl Default for BackendStats {
    fn default() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            success_rate: 1.0,
            average_streaming_ttft_ms: 0.0,
            average_non_streaming_ttft_ms: 0.0,
            streaming_ttft_samples: 0,
            non_streaming_ttft_samples: 0,
        }
    }
}

impl BackendStats {
    /// Error rate over the window; the complement of the success rate.
    pub fn error_rate(&self) -> f64 {
        1.0 - self.success_rate
    }

    /// Mean TTFT for the given stream mode, `None` when no samples exist.
    pub fn ttft_ms(&self, stream: StreamType) -> Option<f64> {
        match stream {
            StreamType::Streaming if self.streaming_ttft_samples > 0 => {
                Some(self.average_streaming_ttft_ms)
            }
            StreamType::NonStreaming if self.non_streaming_ttft_samples > 0 => {
                Some(self.average_non_streaming_ttft_ms)
            }
            _ => None,
        }
    }
}

/// Filter for the minute-bucketed time series.
#[derive(Debug, Clone)]
pub struct HistoricalQuery {
    pub backend_id: Option<String>,
    pub instance_id: Option<String>,
    pub window: TimeWindow,
    pub limit: Option<usize>,
}

/// One minute of aggregated history for a backend.
#[derive(Debug, Clone, Serialize)]
pub struct MinuteBucketStats {
    pub backend_id: String,
    /// Minute-aligned bucket start.
    pub bucket: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_streaming_ttft_ms: Option<f64>,
    pub average_non_streaming_ttft_ms: Option<f64>,
}

/// Sink and query surface for request metrics.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    /// False only for the noop collector. Strategies that need stats check
    /// this and report a configuration error instead of routing blind.
    fn enabled(&self) -> bool {
        true
    }

    async fn record_request_complete(&self, metric: RequestMetric);

    async fn get_stats(&self, backend_id: &str, window: TimeWindow) -> BackendStats;

    async fn get_all_stats(&self, window: TimeWindow) -> HashMap<String, BackendStats>;

    async fn get_historical_stats(&self, query: HistoricalQuery) -> Vec<MinuteBucketStats>;
}
