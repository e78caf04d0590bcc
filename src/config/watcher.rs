//! Hot reload of the configuration file.
//!
//! Editors and deploy tooling rarely produce one clean write: a save can
//! surface as several modify/create events in quick succession, or as a
//! truncate followed by the real content. Raw filesystem events are
//! therefore treated only as dirty marks; the apply task waits for the
//! burst to go quiet, then loads, expands and validates the file once and
//! swaps the result into the registry. A load that fails at any stage
//! leaves the current snapshot authoritative.

use crate::auth::RegistryApiKeyStore;
use crate::config::loader::load_config;
use crate::config::ConfigRegistry;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Quiet period after the last file event before a reload is attempted.
const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watches the config file and republishes snapshots on change.
pub struct ConfigWatcher {
    path: PathBuf,
    registry: Arc<ConfigRegistry>,
    key_store: Arc<RegistryApiKeyStore>,
}

impl ConfigWatcher {
    pub fn new(
        path: &Path,
        registry: Arc<ConfigRegistry>,
        key_store: Arc<RegistryApiKeyStore>,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            registry,
            key_store,
        }
    }

    /// Start the filesystem watch and the debounced apply task.
    ///
    /// The returned notify handle must be kept alive for events to keep
    /// flowing; dropping it silently stops hot reload.
    pub fn spawn(
        self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<RecommendedWatcher, notify::Error> {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        let _ = dirty_tx.send(());
                    }
                }
                Err(e) => tracing::error!(error = %e, "Config watch error"),
            },
            notify::Config::default(),
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(
            path = ?self.path,
            debounce_ms = DEBOUNCE.as_millis() as u64,
            "Watching config for changes"
        );

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    mark = dirty_rx.recv() => {
                        if mark.is_none() {
                            break;
                        }
                        // coalesce the rest of the write burst
                        loop {
                            tokio::select! {
                                more = dirty_rx.recv() => {
                                    if more.is_none() {
                                        return;
                                    }
                                }
                                _ = tokio::time::sleep(DEBOUNCE) => break,
                            }
                        }
                        self.apply();
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Config watcher shutting down");
                        break;
                    }
                }
            }
        });

        Ok(watcher)
    }

    /// One reload attempt: load and validate the file, then atomically swap
    /// the new snapshot in and reconcile the caller key store against it.
    fn apply(&self) {
        match load_config(&self.path) {
            Ok(config) => {
                self.registry.publish(&config);
                self.key_store.reconcile(&config);
                tracing::info!(
                    models = config.models.len(),
                    api_keys = config.api_keys.len(),
                    "Configuration reloaded"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Config reload failed; keeping the current snapshot"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ApiKeyStore;
    use crate::config::ProxyConfig;

    const VALID: &str = r#"
        [[models]]
        model = "gpt-4"
        provider = "openai"

        [[models.backends]]
        id = "a"
        provider = "openai"

        [models.backends.provider_config]
        provider = "openai"
        url = "https://api.openai.com"
        api_key = "sk-a"

        [[api_keys]]
        key = "caller-key"
        models = ["gpt-4"]
    "#;

    fn temp_config(name: &str, content: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("model-proxy-watcher-{name}.toml"));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn watcher_for(path: &Path) -> ConfigWatcher {
        let empty = ProxyConfig::default();
        ConfigWatcher::new(
            path,
            Arc::new(ConfigRegistry::new(&empty)),
            RegistryApiKeyStore::new(&empty),
        )
    }

    #[tokio::test]
    async fn test_apply_publishes_snapshot_and_keys() {
        let path = temp_config("valid", VALID);
        let watcher = watcher_for(&path);

        assert!(watcher.registry.snapshot().model("gpt-4").is_none());
        watcher.apply();

        assert!(watcher.registry.snapshot().model("gpt-4").is_some());
        assert!(watcher
            .key_store
            .authenticate("caller-key")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_last_good_snapshot() {
        let path = temp_config("broken", VALID);
        let watcher = watcher_for(&path);
        watcher.apply();
        assert!(watcher.registry.snapshot().model("gpt-4").is_some());

        // a torn write mid-save must not dislodge the running config
        std::fs::write(&path, "[[models]]\nmodel = ").unwrap();
        watcher.apply();
        assert!(watcher.registry.snapshot().model("gpt-4").is_some());

        // neither may a config that parses but fails validation
        std::fs::write(
            &path,
            "[[api_keys]]\nkey = \"k\"\nmodels = [\"ghost-model\"]\n",
        )
        .unwrap();
        watcher.apply();
        assert!(watcher.registry.snapshot().model("gpt-4").is_some());
        assert!(watcher
            .key_store
            .authenticate("caller-key")
            .await
            .unwrap()
            .is_some());
    }
}
