//! In-memory metrics aggregation.
//!
//! Records collapse into buckets keyed (backend, instance, minute) at
//! append time; windowed reads are flat sums of counts with a
//! sample-count-weighted mean of TTFTs. Minutes with no TTFT samples are
//! ignored by the means. Arrival order does not matter because bucketing
//! uses the record's own timestamp.

use super::{
    BackendStats, HistoricalQuery, MetricsCollector, MinuteBucketStats, RequestMetric,
    RequestStatus, StreamType, TimeWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::{DashMap, DashSet};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

/// How much history the in-memory store keeps, in minutes.
const RETENTION_MINUTES: i64 = 24 * 60;

#[derive(Debug, Default, Clone)]
struct Bucket {
    success: u64,
    failure: u64,
    streaming_ttft_sum_ms: f64,
    streaming_ttft_samples: u64,
    non_streaming_ttft_sum_ms: f64,
    non_streaming_ttft_samples: u64,
}

impl Bucket {
    fn total(&self) -> u64 {
        self.success + self.failure
    }

    fn absorb(&mut self, metric: &RequestMetric) {
        match metric.status {
            RequestStatus::Success => self.success += 1,
            RequestStatus::Failure => self.failure += 1,
        }
        if let Some(ttft) = metric.ttft_ms {
            match metric.stream_type {
                Some(StreamType::Streaming) => {
                    self.streaming_ttft_sum_ms += ttft as f64;
                    self.streaming_ttft_samples += 1;
                }
                Some(StreamType::NonStreaming) => {
                    self.non_streaming_ttft_sum_ms += ttft as f64;
                    self.non_streaming_ttft_samples += 1;
                }
                None => {}
            }
        }
    }

    fn merge(&mut self, other: &Bucket) {
        self.success += other.success;
        self.failure += other.failure;
        self.streaming_ttft_sum_ms += other.streaming_ttft_sum_ms;
        self.streaming_ttft_samples += other.streaming_ttft_samples;
        self.non_streaming_ttft_sum_ms += other.non_streaming_ttft_sum_ms;
        self.non_streaming_ttft_samples += other.non_streaming_ttft_samples;
    }
}

type BucketKey = (String, String, i64);

/// Minute-bucketed metrics store for a single process.
pub struct InMemoryMetricsCollector {
    buckets: DashMap<BucketKey, Bucket>,
    /// Replayed completions are dropped; one completion, one record.
    seen: DashSet<String>,
    last_prune_minute: AtomicI64,
}

impl InMemoryMetricsCollector {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            seen: DashSet::new(),
            last_prune_minute: AtomicI64::new(0),
        }
    }

    fn minute_of(ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(60)
    }

    fn minute_start(minute: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(minute * 60, 0).single().unwrap_or_default()
    }

    fn prune(&self, now_minute: i64) {
        let last = self.last_prune_minute.load(Ordering::Relaxed);
        if now_minute <= last {
            return;
        }
        if self
            .last_prune_minute
            .compare_exchange(last, now_minute, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let horizon = now_minute - RETENTION_MINUTES;
        self.buckets.retain(|(_, _, minute), _| *minute >= horizon);
        // the dedup set grows one entry per completion; clear it alongside
        // the buckets it guarded once the horizon passes
        if self.seen.len() > 1_000_000 {
            self.seen.clear();
        }
    }

    fn windowed_bucket(&self, backend_id: &str, window: TimeWindow) -> Bucket {
        let start = Self::minute_of(window.start);
        let end = Self::minute_of(window.end);
        let mut merged = Bucket::default();
        for entry in self.buckets.iter() {
            let (bid, _, minute) = entry.key();
            if bid == backend_id && *minute >= start && *minute <= end {
                merged.merge(entry.value());
            }
        }
        merged
    }

    fn stats_from(bucket: &Bucket) -> BackendStats {
        let total = bucket.total();
        BackendStats {
            total_requests: total,
            successful_requests: bucket.success,
            failed_requests: bucket.failure,
            success_rate: if total == 0 {
                1.0
            } else {
                bucket.success as f64 / total as f64
            },
            average_streaming_ttft_ms: if bucket.streaming_ttft_samples == 0 {
                0.0
            } else {
                bucket.streaming_ttft_sum_ms / bucket.streaming_ttft_samples as f64
            },
            average_non_streaming_ttft_ms: if bucket.non_streaming_ttft_samples == 0 {
                0.0
            } else {
                bucket.non_streaming_ttft_sum_ms / bucket.non_streaming_ttft_samples as f64
            },
            streaming_ttft_samples: bucket.streaming_ttft_samples,
            non_streaming_ttft_samples: bucket.non_streaming_ttft_samples,
        }
    }
}

impl Default for InMemoryMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsCollector for InMemoryMetricsCollector {
    async fn record_request_complete(&self, metric: RequestMetric) {
        let dedup_key = format!("{}|{}", metric.backend_id, metric.request_id);
        if !self.seen.insert(dedup_key) {
            tracing::debug!(
                backend_id = %metric.backend_id,
                request_id = %metric.request_id,
                "Dropping replayed request metric"
            );
            return;
        }

        let minute = Self::minute_of(metric.timestamp);
        self.buckets
            .entry((
                metric.backend_id.clone(),
                metric.instance_id.clone(),
                minute,
            ))
            .or_default()
            .absorb(&metric);

        self.prune(Self::minute_of(Utc::now()));
    }

    async fn get_stats(&self, backend_id: &str, window: TimeWindow) -> BackendStats {
        Self::stats_from(&self.windowed_bucket(backend_id, window))
    }

    async fn get_all_stats(&self, window: TimeWindow) -> HashMap<String, BackendStats> {
        let start = Self::minute_of(window.start);
        let end = Self::minute_of(window.end);
        let mut merged: HashMap<String, Bucket> = HashMap::new();
        for entry in self.buckets.iter() {
            let (backend_id, _, minute) = entry.key();
            if *minute >= start && *minute <= end {
                merged
                    .entry(backend_id.clone())
                    .or_default()
                    .merge(entry.value());
            }
        }
        merged
            .into_iter()
            .map(|(backend_id, bucket)| (backend_id, Self::stats_from(&bucket)))
            .collect()
    }

    async fn get_historical_stats(&self, query: HistoricalQuery) -> Vec<MinuteBucketStats> {
        let start = Self::minute_of(query.window.start);
        let end = Self::minute_of(query.window.end);

        // merge instances per (backend, minute) unless filtered
        let mut merged: HashMap<(String, i64), Bucket> = HashMap::new();
        for entry in self.buckets.iter() {
            let (backend_id, instance_id, minute) = entry.key();
            if *minute < start || *minute > end {
                continue;
            }
            if let Some(ref want) = query.backend_id {
                if want != backend_id {
                    continue;
                }
            }
            if let Some(ref want) = query.instance_id {
                if want != instance_id {
                    continue;
                }
            }
            merged
                .entry((backend_id.clone(), *minute))
                .or_default()
                .merge(entry.value());
        }

        let mut series: Vec<MinuteBucketStats> = merged
            .into_iter()
            .map(|((backend_id, minute), bucket)| MinuteBucketStats {
                backend_id,
                bucket: Self::minute_start(minute),
                total_requests: bucket.total(),
                successful_requests: bucket.success,
                failed_requests: bucket.failure,
                average_streaming_ttft_ms: (bucket.streaming_ttft_samples > 0)
                    .then(|| bucket.streaming_ttft_sum_ms / bucket.streaming_ttft_samples as f64),
                average_non_streaming_ttft_ms: (bucket.non_streaming_ttft_samples > 0).then(|| {
                    bucket.non_streaming_ttft_sum_ms / bucket.non_streaming_ttft_samples as f64
                }),
            })
            .collect();

        series.sort_by(|a, b| a.bucket.cmp(&b.bucket).then(a.backend_id.cmp(&b.backend_id)));
        if let Some(limit) = query.limit {
            if series.len() > limit {
                series.drain(..series.len() - limit);
            }
        }
        series
    }
}
