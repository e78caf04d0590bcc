//! Model-aware reverse proxy binary.

use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use model_proxy::config::loader::load_config;
use model_proxy::config::settings::{Cli, Settings};
use model_proxy::config::watcher::ConfigWatcher;
use model_proxy::instance::InstanceId;
use model_proxy::observability;
use model_proxy::store::memory::MemoryActiveRequestStore;
use model_proxy::store::redis::RedisActiveRequestStore;
use model_proxy::store::ActiveRequestStore;
use model_proxy::{AppState, HttpServer, ProxyConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "model_proxy=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("model-proxy v0.1.0 starting");

    let cli = Cli::parse();
    let settings = Settings::resolve(&cli);

    // Create a default config if it doesn't exist (for easier first run)
    if !settings.config_path.exists() {
        tracing::warn!(path = ?settings.config_path, "Config not found, creating empty configuration");
        let default_config = ProxyConfig::default();
        let toml_string = toml::to_string_pretty(&default_config)?;
        std::fs::write(&settings.config_path, toml_string)?;
    }

    let config = match load_config(&settings.config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Failed to load initial configuration: {}. Exiting.", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        models = config.models.len(),
        api_keys = config.api_keys.len(),
        port = settings.port,
        "Configuration loaded"
    );

    // Prometheus exporter, when an address is configured
    if let Some(metrics_address) = &settings.metrics_address {
        if let Ok(addr) = metrics_address.parse() {
            observability::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let instance = InstanceId::resolve();
    tracing::info!(instance_id = %instance, "Instance identity resolved");

    // Slot store: redis for multi-instance deployments, in-memory otherwise
    let store: Arc<dyn ActiveRequestStore> = match &settings.redis_url {
        Some(url) => {
            match RedisActiveRequestStore::connect(url, instance.clone()).await {
                Ok(store) => {
                    tracing::info!("Active-request store: redis");
                    Arc::new(store)
                }
                Err(e) => {
                    tracing::error!("Failed to connect to redis: {}. Exiting.", e);
                    std::process::exit(1);
                }
            }
        }
        None => {
            tracing::info!("Active-request store: in-memory (single instance)");
            Arc::new(MemoryActiveRequestStore::new(instance.clone()))
        }
    };

    let (state, key_store) = AppState::build(&config, &settings, instance, Some(store));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Start the configuration watcher; its handle must outlive the server
    let watcher = ConfigWatcher::new(&settings.config_path, state.registry.clone(), key_store);
    let _watcher = watcher.spawn(shutdown_tx.subscribe())?;

    // Translate OS signals into the shutdown broadcast
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let server = HttpServer::new(state);
    server.run(listener, shutdown_rx).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
