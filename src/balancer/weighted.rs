//! Weighted random load balancing strategy.

use super::pick_by_weight;
use crate::config::schema::BackendConfig;

/// Select with probability proportional to configured weight.
///
/// Callers guarantee `eligible` is non-empty and every member has
/// `weight > 0`.
pub fn pick<'a>(eligible: &[&'a BackendConfig]) -> &'a BackendConfig {
    let weights: Vec<f64> = eligible.iter().map(|b| b.weight as f64).collect();
    pick_by_weight(eligible, &weights)
}
