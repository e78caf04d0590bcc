//! Configuration subsystem.
//!
//! # Data Flow
//! ```text
//! config.toml → loader.rs (env expansion + parse + validate)
//!     → registry.rs (atomic snapshot, read by every request)
//!     → watcher.rs (debounced change detection; applies new snapshots
//!       to the registry and key store, keeping the last good one on error)
//! settings.rs: process-wide env/CLI settings (port, admin keys, stores)
//! ```

pub mod loader;
pub mod registry;
pub mod schema;
pub mod settings;
pub mod validation;
pub mod watcher;

pub use registry::{ConfigRegistry, ConfigSnapshot};
pub use schema::ProxyConfig;
pub use settings::Settings;
