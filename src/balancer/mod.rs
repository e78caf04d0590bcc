//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher → select(model, input)
//!     → forced X-Backend-ID (explicit errors, never a fallback)
//!     → affinity manager (sticky session hit wins)
//!     → strategy over eligible backends (enabled AND weight > 0):
//!         - weighted.rs (draw proportional to weight)
//!         - lowest_ttft.rs (windowed TTFT stats, cold-start fill-in)
//!         - min_error_rate.rs (circuit breaking + inverse-error draw)
//!     → chosen backend or explicit no-backend error
//! ```

pub mod lowest_ttft;
pub mod min_error_rate;
pub mod weighted;

use crate::affinity::AffinityManager;
use crate::config::schema::{BackendConfig, LoadBalancingStrategy, ModelConfig};
use crate::metrics::MetricsCollector;
use rand::Rng;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("backend '{backend_id}' not found for model '{model}'")]
    ForcedBackendNotFound { backend_id: String, model: String },

    #[error("backend '{backend_id}' is disabled")]
    ForcedBackendDisabled { backend_id: String },

    #[error("no enabled backend available for model '{model}'")]
    NoBackend { model: String },

    #[error("strategy '{strategy}' requires metrics, but metrics collection is disabled")]
    MetricsRequired { strategy: &'static str },
}

/// Per-request selection context.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectionInput<'a> {
    /// X-Backend-ID header: an explicit pin, honored or failed, never
    /// silently substituted.
    pub force_backend_id: Option<&'a str>,

    /// X-Session-ID header: affinity key when the model enables stickiness.
    pub session_id: Option<&'a str>,

    /// The caller's `stream` flag; picks which TTFT column lowest-ttft reads.
    pub is_stream: bool,
}

/// Strategy dispatch plus the selection precedence shared by every model.
pub struct LoadBalancer {
    metrics: Arc<dyn MetricsCollector>,
    affinity: Arc<AffinityManager>,
}

impl LoadBalancer {
    pub fn new(metrics: Arc<dyn MetricsCollector>, affinity: Arc<AffinityManager>) -> Self {
        Self { metrics, affinity }
    }

    /// Choose the backend for a request on `model`.
    pub async fn select(
        &self,
        model: &ModelConfig,
        input: SelectionInput<'_>,
    ) -> Result<BackendConfig, SelectionError> {
        // 1. Forced selection
        if let Some(forced) = input.force_backend_id {
            return match model.backend(forced) {
                None => Err(SelectionError::ForcedBackendNotFound {
                    backend_id: forced.to_string(),
                    model: model.model.clone(),
                }),
                Some(backend) if !backend.enabled => Err(SelectionError::ForcedBackendDisabled {
                    backend_id: forced.to_string(),
                }),
                Some(backend) => Ok(backend.clone()),
            };
        }

        // 2. Session affinity
        if model.enable_affinity {
            if let Some(session_id) = input.session_id {
                if let Some(backend) = self.affinity.get_affinity_backend(model, session_id) {
                    tracing::debug!(
                        model = %model.model,
                        session_id = %session_id,
                        backend_id = %backend.id,
                        "Affinity hit"
                    );
                    return Ok(backend);
                }
            }
        }

        // 3. Strategy over the eligible set
        let eligible = model.eligible_backends();
        if eligible.is_empty() {
            return Err(SelectionError::NoBackend {
                model: model.model.clone(),
            });
        }
        if eligible.len() == 1 {
            return Ok(eligible[0].clone());
        }

        let chosen = match model.load_balancing_strategy {
            LoadBalancingStrategy::Weighted => weighted::pick(&eligible),
            LoadBalancingStrategy::LowestTtft => {
                lowest_ttft::pick(&eligible, input.is_stream, self.metrics.as_ref()).await?
            }
            LoadBalancingStrategy::MinErrorRate => {
                min_error_rate::pick(
                    &eligible,
                    &model.min_error_rate_options,
                    self.metrics.as_ref(),
                )
                .await?
            }
        };
        Ok(chosen.clone())
    }
}

/// Weighted random draw over `eligible` with explicit weights, one per
/// backend. Falls back deterministically to the last configured element if
/// the accumulator never settles (unreachable with well-formed weights, but
/// float drift must not panic the request path).
fn pick_by_weight<'a>(eligible: &[&'a BackendConfig], weights: &[f64]) -> &'a BackendConfig {
    debug_assert_eq!(eligible.len(), weights.len());
    debug_assert!(!eligible.is_empty());

    let total: f64 = weights.iter().sum();
    let last = eligible[eligible.len() - 1];
    if total <= 0.0 {
        return last;
    }

    let mut draw = rand::thread_rng().gen_range(0.0..total);
    for (backend, weight) in eligible.iter().zip(weights) {
        if draw < *weight {
            return backend;
        }
        draw -= weight;
    }
    last
}
