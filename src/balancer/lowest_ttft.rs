//! Lowest time-to-first-token load balancing strategy.

use super::SelectionError;
use crate::config::schema::BackendConfig;
use crate::metrics::{MetricsCollector, StreamType, TimeWindow};

/// Observation window for TTFT comparison.
const WINDOW_MINUTES: i64 = 15;

/// TTFT assigned when no eligible backend has any data at all.
const COLD_START_TTFT_MS: f64 = 1000.0;

/// Select the backend with the smallest windowed mean TTFT for the
/// requested stream mode.
///
/// Backends with zero samples in the window are assigned the mean TTFT of
/// the backends that do have data, so a fresh backend is neither shunned
/// nor flooded. Ties break toward configured order.
pub async fn pick<'a>(
    eligible: &[&'a BackendConfig],
    is_stream: bool,
    metrics: &dyn MetricsCollector,
) -> Result<&'a BackendConfig, SelectionError> {
    if !metrics.enabled() {
        return Err(SelectionError::MetricsRequired {
            strategy: "lowest-ttft",
        });
    }

    let window = TimeWindow::last_minutes(WINDOW_MINUTES);
    let mode = if is_stream {
        StreamType::Streaming
    } else {
        StreamType::NonStreaming
    };

    let mut observed: Vec<Option<f64>> = Vec::with_capacity(eligible.len());
    for backend in eligible {
        let stats = metrics.get_stats(&backend.id, window).await;
        observed.push(stats.ttft_ms(mode));
    }

    let known: Vec<f64> = observed.iter().filter_map(|t| *t).collect();
    let cold_fill = if known.is_empty() {
        COLD_START_TTFT_MS
    } else {
        known.iter().sum::<f64>() / known.len() as f64
    };

    let mut best = 0usize;
    let mut best_ttft = observed[0].unwrap_or(cold_fill);
    for (i, ttft) in observed.iter().enumerate().skip(1) {
        let ttft = ttft.unwrap_or(cold_fill);
        // strict comparison keeps the earliest configured backend on ties
        if ttft < best_ttft {
            best = i;
            best_ttft = ttft;
        }
    }

    tracing::debug!(
        backend_id = %eligible[best].id,
        ttft_ms = best_ttft,
        stream = is_stream,
        "Lowest-TTFT selection"
    );
    Ok(eligible[best])
}
