//! HTTP server setup and configuration.

use axum::{extract::DefaultBodyLimit, routing::post, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::affinity::AffinityManager;
use crate::auth::{AdminAuth, ApiKeyStore, RegistryApiKeyStore};
use crate::balancer::LoadBalancer;
use crate::config::settings::Settings;
use crate::config::{ConfigRegistry, ProxyConfig};
use crate::instance::InstanceId;
use crate::limiter::ConcurrencyLimiter;
use crate::metrics::memory::InMemoryMetricsCollector;
use crate::metrics::noop::NoopMetricsCollector;
use crate::metrics::MetricsCollector;
use crate::proxy::handler::chat_completions;
use crate::store::ActiveRequestStore;

/// Everything a request handler needs, threaded explicitly. No module
/// globals, so tests can assemble alternative wirings.
#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub registry: Arc<ConfigRegistry>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub metrics: Arc<dyn MetricsCollector>,
    pub affinity: Arc<AffinityManager>,
    pub balancer: Arc<LoadBalancer>,
    pub store: Option<Arc<dyn ActiveRequestStore>>,
    pub instance: InstanceId,
    pub admin_auth: AdminAuth,
}

impl AppState {
    /// Assemble the standard wiring from a validated config.
    ///
    /// Returns the concrete key store alongside so the reload task can
    /// reconcile it.
    pub fn build(
        config: &ProxyConfig,
        settings: &Settings,
        instance: InstanceId,
        store: Option<Arc<dyn ActiveRequestStore>>,
    ) -> (Self, Arc<RegistryApiKeyStore>) {
        let registry = Arc::new(ConfigRegistry::new(config));
        let key_store = RegistryApiKeyStore::new(config);
        let metrics: Arc<dyn MetricsCollector> = if settings.enable_metrics {
            Arc::new(InMemoryMetricsCollector::new())
        } else {
            tracing::warn!("Request metrics disabled; stats-driven strategies will reject");
            Arc::new(NoopMetricsCollector)
        };
        let affinity = Arc::new(AffinityManager::new());
        let balancer = Arc::new(LoadBalancer::new(metrics.clone(), affinity.clone()));
        let limiter = Arc::new(ConcurrencyLimiter::new(store.clone()));
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build upstream http client");

        let state = Self {
            http,
            registry,
            api_keys: key_store.clone(),
            limiter,
            metrics,
            affinity,
            balancer,
            store,
            instance,
            admin_auth: AdminAuth::new(settings.admin_api_keys.clone()),
        };
        (state, key_store)
    }
}

/// HTTP server for the model proxy.
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// The full application router: caller surface plus admin surface.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/v1/chat/completions", post(chat_completions))
            .with_state(state.clone())
            .merge(crate::admin::setup_admin_router(state))
            .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Config hot reload runs in the watcher, not here; this owns startup
    /// slot recovery, the affinity sweeper, and graceful shutdown.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        // A predecessor with our instance id may have crashed while holding
        // slots; clear them before taking traffic.
        if let Some(store) = &self.state.store {
            match store.cleanup(self.state.instance.as_str()).await {
                Ok(removed) if removed > 0 => {
                    tracing::warn!(removed, "Recovered stale slots from a previous run")
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Startup slot cleanup failed"),
            }
        }

        // Affinity TTL sweeper
        let affinity = self.state.affinity.clone();
        let mut sweeper_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = interval.tick() => { affinity.sweep(); }
                    _ = sweeper_shutdown.recv() => break,
                }
            }
        });

        let store = self.state.store.clone();
        let app = Self::router(self.state);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server initiating graceful shutdown");
            })
            .await?;

        // Give back every slot this instance still owns
        if let Some(store) = &store {
            if let Err(e) = store.shutdown().await {
                tracing::warn!(error = %e, "Slot cleanup on shutdown failed");
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
