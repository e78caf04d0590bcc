//! No-op collector for metrics-disabled deployments.

use super::{
    BackendStats, HistoricalQuery, MetricsCollector, MinuteBucketStats, RequestMetric, TimeWindow,
};
use async_trait::async_trait;
use std::collections::HashMap;

/// Discards every record and serves zero-valued stats.
///
/// Load balancing strategies that need stats check [`MetricsCollector::enabled`]
/// and refuse to run against this collector.
pub struct NoopMetricsCollector;

#[async_trait]
impl MetricsCollector for NoopMetricsCollector {
    fn enabled(&self) -> bool {
        false
    }

    async fn record_request_complete(&self, _metric: RequestMetric) {}

    async fn get_stats(&self, _backend_id: &str, _window: TimeWindow) -> BackendStats {
        BackendStats::default()
    }

    async fn get_all_stats(&self, _window: TimeWindow) -> HashMap<String, BackendStats> {
        HashMap::new()
    }

    async fn get_historical_stats(&self, _query: HistoricalQuery) -> Vec<MinuteBucketStats> {
        Vec::new()
    }
}
