//! Process-wide settings from environment variables and CLI flags.

use clap::Parser;
use std::path::PathBuf;

const DEFAULT_PORT: u16 = 51818;

/// Command-line overrides. Environment variables take effect when the
/// corresponding flag is absent.
#[derive(Debug, Parser)]
#[command(name = "model-proxy", about = "Model-aware reverse proxy for chat completion APIs")]
pub struct Cli {
    /// Path to the model/api-key configuration file; falls back to the
    /// CONFIG_PATH environment variable, then "config.toml".
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen port; overrides the PORT environment variable.
    #[arg(long)]
    pub port: Option<u16>,
}

/// Resolved process settings.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path of the watched configuration file.
    pub config_path: PathBuf,

    /// Caller-facing listen port.
    pub port: u16,

    /// Admin bearer tokens; empty disables admin auth.
    pub admin_api_keys: Vec<String>,

    /// Request metrics collection toggle. Disabling swaps in the noop
    /// collector, which stats-requiring strategies reject.
    pub enable_metrics: bool,

    /// Prometheus exporter bind address, when set.
    pub metrics_address: Option<String>,

    /// Redis connection string for the cross-instance active-request store.
    /// Absent means single-instance in-memory tracking.
    pub redis_url: Option<String>,
}

impl Settings {
    /// Build settings from the CLI and the process environment.
    pub fn resolve(cli: &Cli) -> Self {
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config.toml"));

        let port = cli
            .port
            .or_else(|| env_parse("PORT"))
            .unwrap_or(DEFAULT_PORT);

        let admin_api_keys = std::env::var("ADMIN_APIKEYS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        // Metrics default on; only the literal "false" disables them.
        let enable_metrics = std::env::var("ENABLE_METRICS")
            .map(|v| v != "false")
            .unwrap_or(true);

        Self {
            config_path,
            port,
            admin_api_keys,
            enable_metrics,
            metrics_address: std::env::var("METRICS_ADDRESS").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
