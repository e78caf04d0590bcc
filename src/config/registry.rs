//! In-memory snapshot of the model configuration.
//!
//! Writers (the config reload task) publish a full snapshot atomically;
//! readers load an `Arc` and see a consistent document for the whole
//! request. No reader-writer locks on the request path.

use crate::config::schema::{ModelConfig, ProxyConfig};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable view of the configured models, indexed by model name.
#[derive(Debug, Default)]
pub struct ConfigSnapshot {
    models: HashMap<String, Arc<ModelConfig>>,
}

impl ConfigSnapshot {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let models = config
            .models
            .iter()
            .map(|m| (m.model.clone(), Arc::new(m.clone())))
            .collect();
        Self { models }
    }

    /// Look up a model by its caller-facing name.
    pub fn model(&self, name: &str) -> Option<Arc<ModelConfig>> {
        self.models.get(name).cloned()
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelConfig>> {
        self.models.values()
    }
}

/// Holds the latest configuration snapshot behind an atomic pointer.
#[derive(Debug)]
pub struct ConfigRegistry {
    snapshot: ArcSwap<ConfigSnapshot>,
}

impl ConfigRegistry {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ConfigSnapshot::from_config(config)),
        }
    }

    /// The current snapshot. Cheap; safe to hold across await points.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replace the snapshot with one built from `config`.
    pub fn publish(&self, config: &ProxyConfig) {
        let next = ConfigSnapshot::from_config(config);
        tracing::info!(models = next.model_count(), "Publishing config snapshot");
        self.snapshot.store(Arc::new(next));
    }
}
