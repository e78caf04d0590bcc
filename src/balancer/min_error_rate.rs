//! Minimum-error-rate load balancing strategy with circuit breaking.

use super::{pick_by_weight, weighted, SelectionError};
use crate::config::schema::{BackendConfig, MinErrorRateOptions};
use crate::metrics::{MetricsCollector, TimeWindow};

/// Error rate assumed for cold backends when no peer has enough data.
const COLD_START_ERROR_RATE: f64 = 0.1;

/// Select by drawing proportional to `weight / (effective_error_rate + epsilon)`,
/// after excluding circuit-broken backends.
///
/// A backend is circuit-broken when it has at least `min_requests` samples
/// in the window AND its error rate exceeds the breaker threshold. The
/// breaker releases by time alone: once the bad minutes age out of the
/// window the backend re-enters at the cold-start rate.
pub async fn pick<'a>(
    eligible: &[&'a BackendConfig],
    options: &MinErrorRateOptions,
    metrics: &dyn MetricsCollector,
) -> Result<&'a BackendConfig, SelectionError> {
    if !metrics.enabled() {
        return Err(SelectionError::MetricsRequired {
            strategy: "min-error-rate",
        });
    }

    let window = TimeWindow::last_minutes(options.time_window_minutes);

    let mut totals = Vec::with_capacity(eligible.len());
    let mut rates = Vec::with_capacity(eligible.len());
    for backend in eligible {
        let stats = metrics.get_stats(&backend.id, window).await;
        totals.push(stats.total_requests);
        rates.push(stats.error_rate());
    }

    let sufficient: Vec<f64> = totals
        .iter()
        .zip(&rates)
        .filter(|(total, _)| **total >= options.min_requests)
        .map(|(_, rate)| *rate)
        .collect();
    let fallback_rate = if sufficient.is_empty() {
        COLD_START_ERROR_RATE
    } else {
        sufficient.iter().sum::<f64>() / sufficient.len() as f64
    };

    let mut surviving: Vec<&BackendConfig> = Vec::with_capacity(eligible.len());
    let mut weights: Vec<f64> = Vec::with_capacity(eligible.len());
    for ((backend, total), rate) in eligible.iter().zip(&totals).zip(&rates) {
        let broken = *total >= options.min_requests && *rate > options.circuit_breaker_threshold;
        if broken {
            tracing::debug!(
                backend_id = %backend.id,
                error_rate = rate,
                total_requests = total,
                "Backend circuit-broken for this selection"
            );
            continue;
        }
        let effective = if *total >= options.min_requests {
            *rate
        } else {
            fallback_rate
        };
        surviving.push(*backend);
        weights.push(backend.weight as f64 / (effective + options.epsilon));
    }

    if surviving.is_empty() {
        tracing::warn!(
            "Every eligible backend is circuit-broken; degrading to weighted selection"
        );
        return Ok(weighted::pick(eligible));
    }

    Ok(pick_by_weight(&surviving, &weights))
}
