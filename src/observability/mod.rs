//! Operational metrics exposition.
//!
//! These are the process-level Prometheus series for dashboards and
//! alerting. The routing-feeding request metrics live in [`crate::metrics`]
//! and are a separate pipeline.

pub mod metrics;

pub use metrics::{init_metrics, record_completion, record_ttft};
