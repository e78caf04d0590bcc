//! Active-request store: the shared slot-tracking state behind the
//! concurrency limiter.
//!
//! # Responsibilities
//! - Atomic "try-start-if-under-limit" per backend, linearized across
//!   proxy instances
//! - Per-instance ownership tracking for crash recovery
//! - Age out entries whose owner died without releasing (10 minutes)
//!
//! All operations are idempotent with respect to `(backend_id, request_id)`.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Slots older than this are considered leaked by a crashed instance and
/// evicted before any count is taken.
pub const ENTRY_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Backing store for in-flight request slots.
#[async_trait]
pub trait ActiveRequestStore: Send + Sync {
    /// Atomically: evict entries for this backend older than [`ENTRY_TTL`];
    /// if the entry already exists return true; if `max_limit` is 0 insert
    /// and return true; otherwise insert-and-return-true iff the live count
    /// is below `max_limit`.
    async fn try_record_start(
        &self,
        backend_id: &str,
        request_id: &str,
        max_limit: u32,
    ) -> Result<bool, StoreError>;

    /// Unconditional insert/refresh.
    async fn record_start(&self, backend_id: &str, request_id: &str) -> Result<(), StoreError>;

    /// Remove the entry. A missing entry is not an error.
    async fn record_complete(&self, backend_id: &str, request_id: &str)
        -> Result<(), StoreError>;

    /// Live entry count for one backend, after eviction.
    async fn get_count(&self, backend_id: &str) -> Result<usize, StoreError>;

    /// Live entry counts for every tracked backend.
    async fn get_all_counts(&self) -> Result<HashMap<String, usize>, StoreError>;

    /// Remove all entries owned by `instance_id`; returns how many were
    /// removed. Called on startup against a crashed predecessor's id and on
    /// shutdown against our own.
    async fn cleanup(&self, instance_id: &str) -> Result<usize, StoreError>;

    /// Release everything this instance still owns.
    async fn shutdown(&self) -> Result<usize, StoreError>;
}
