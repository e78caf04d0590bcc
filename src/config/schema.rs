//! Configuration schema definitions.
//!
//! This module defines the model routing configuration for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration: routed models and caller API keys.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Logical models exposed by the proxy.
    pub models: Vec<ModelConfig>,

    /// Caller credentials and their model allow-lists.
    pub api_keys: Vec<ApiKeyConfig>,
}

/// Upstream provider kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Openai,
    Bedrock,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Openai => write!(f, "openai"),
            ProviderKind::Bedrock => write!(f, "bedrock"),
        }
    }
}

/// Provider-specific connection settings, discriminated by a `provider`
/// tag inside the block.
///
/// The tag must match the owning backend's `provider`; validation rejects
/// configs where they disagree.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    Openai {
        /// Base URL of the upstream, e.g. "https://api.openai.com".
        url: String,
        api_key: String,
    },
    Bedrock {
        /// AWS region, e.g. "us-east-1".
        region: String,
        access_key_id: String,
        secret_access_key: String,
    },
}

impl ProviderConfig {
    /// The provider this payload belongs to.
    pub fn provider(&self) -> ProviderKind {
        match self {
            ProviderConfig::Openai { .. } => ProviderKind::Openai,
            ProviderConfig::Bedrock { .. } => ProviderKind::Bedrock,
        }
    }
}

/// Load balancing strategy for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    Weighted,
    #[serde(alias = "lowest_ttft")]
    LowestTtft,
    #[serde(alias = "min_error_rate")]
    MinErrorRate,
}

/// Tuning knobs for the min-error-rate strategy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MinErrorRateOptions {
    /// Minimum samples before a backend's own error rate is trusted.
    pub min_requests: u64,

    /// Error rate above which a backend is circuit-broken, in [0, 1].
    pub circuit_breaker_threshold: f64,

    /// Additive smoothing so zero-error backends keep finite weight.
    pub epsilon: f64,

    /// Width of the error-rate observation window, in minutes.
    pub time_window_minutes: i64,
}

impl Default for MinErrorRateOptions {
    fn default() -> Self {
        Self {
            min_requests: 20,
            circuit_breaker_threshold: 0.9,
            epsilon: 0.001,
            time_window_minutes: 15,
        }
    }
}

/// One logical model: the routing unit.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Globally unique model name callers address.
    pub model: String,

    /// Provider all of this model's backends must use.
    pub provider: ProviderKind,

    /// Upstream backends, in configured order. Order is the tie-break and
    /// the fallback order.
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,

    /// Sticky session routing via the X-Session-ID header.
    #[serde(default)]
    pub enable_affinity: bool,

    /// Store a fresh affinity mapping after a successful dispatch.
    #[serde(default = "default_true")]
    pub affinity_write_on_dispatch: bool,

    #[serde(default)]
    pub min_error_rate_options: MinErrorRateOptions,
}

impl ModelConfig {
    /// Look up a backend by id.
    pub fn backend(&self, id: &str) -> Option<&BackendConfig> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Backends that may receive traffic: enabled with a positive weight.
    pub fn eligible_backends(&self) -> Vec<&BackendConfig> {
        self.backends
            .iter()
            .filter(|b| b.enabled && b.weight > 0)
            .collect()
    }

    /// Enabled backends in configured order, used for fallback iteration.
    pub fn enabled_backends(&self) -> impl Iterator<Item = &BackendConfig> {
        self.backends.iter().filter(|b| b.enabled)
    }
}

/// One upstream within a model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Unique within the owning model; immutable.
    pub id: String,

    /// Must equal the owning model's provider.
    pub provider: ProviderKind,

    pub provider_config: ProviderConfig,

    /// Selection weight; 0 excludes the backend from selection.
    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Substituted for the caller's model name in the upstream body.
    #[serde(default)]
    pub model_override: Option<String>,

    /// Time-to-first-token deadline for streaming requests. 0 or absent
    /// means no deadline.
    #[serde(default)]
    pub streaming_ttft_timeout_ms: Option<u64>,

    /// Total-duration deadline for non-streaming requests. 0 or absent
    /// means no deadline.
    #[serde(default)]
    pub non_streaming_ttft_timeout_ms: Option<u64>,

    /// Emit an audit log line per attempt; does not affect routing.
    #[serde(default)]
    pub record_requests: bool,

    /// Concurrent in-flight request cap across all proxy instances.
    /// 0 means unlimited.
    #[serde(default)]
    pub max_concurrent_requests: u32,
}

impl BackendConfig {
    /// The configured TTFT deadline for the given stream mode, normalized so
    /// a configured 0 reads as "no deadline".
    pub fn ttft_timeout(&self, stream: bool) -> Option<Duration> {
        let ms = if stream {
            self.streaming_ttft_timeout_ms
        } else {
            self.non_streaming_ttft_timeout_ms
        };
        match ms {
            Some(0) | None => None,
            Some(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Caller credential as configured. Runtime bookkeeping (`created_at`,
/// `last_used_at`) lives in the API key store.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    /// The bearer token value; unique.
    pub key: String,

    #[serde(default)]
    pub description: String,

    /// Model names this key may call; must be non-empty.
    pub models: Vec<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_true() -> bool {
    true
}
