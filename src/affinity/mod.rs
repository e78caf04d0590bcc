//! Session affinity: sticky routing of (model, session) pairs to a backend.
//!
//! Mappings are validated against the current config snapshot on every read
//! so a disabled or removed backend never receives sticky traffic; the stale
//! mapping is deleted and the caller falls through to normal selection.
//! Writes are best-effort and never fail the in-flight request.

use crate::config::schema::{BackendConfig, ModelConfig};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mappings idle longer than this are evicted.
const MAPPING_TTL_SECS: i64 = 3600;

/// Sticky route for one (model, session) pair.
#[derive(Debug, Clone, Serialize)]
pub struct AffinityMapping {
    pub model: String,
    pub session_id: String,
    pub backend_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

/// Admin-facing deletion filter. At least one field must be set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AffinityFilter {
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub backend_id: Option<String>,
}

impl AffinityFilter {
    fn is_empty(&self) -> bool {
        self.model.is_none() && self.session_id.is_none() && self.backend_id.is_none()
    }

    fn matches(&self, mapping: &AffinityMapping) -> bool {
        self.model.as_deref().map_or(true, |m| m == mapping.model)
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| s == mapping.session_id)
            && self
                .backend_id
                .as_deref()
                .map_or(true, |b| b == mapping.backend_id)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum AffinityError {
    /// A completely empty filter would wipe every mapping; rejected.
    #[error("affinity filter must set at least one of model, session_id, backend_id")]
    EmptyFilter,
}

/// In-memory affinity table with TTL eviction.
#[derive(Debug, Default)]
pub struct AffinityManager {
    mappings: DashMap<(String, String), AffinityMapping>,
}

impl AffinityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the sticky backend for a session, if one is stored and still
    /// valid. Touches the access bookkeeping on a hit; deletes the mapping
    /// when the referenced backend is gone or disabled.
    pub fn get_affinity_backend(
        &self,
        model: &ModelConfig,
        session_id: &str,
    ) -> Option<BackendConfig> {
        let key = (model.model.clone(), session_id.to_string());

        let backend_id = {
            let mut entry = self.mappings.get_mut(&key)?;
            let age = Utc::now() - entry.last_accessed_at;
            if age > Duration::seconds(MAPPING_TTL_SECS) {
                drop(entry);
                self.mappings.remove(&key);
                return None;
            }
            entry.last_accessed_at = Utc::now();
            entry.access_count += 1;
            entry.backend_id.clone()
        };

        match model.backend(&backend_id) {
            Some(backend) if backend.enabled => Some(backend.clone()),
            _ => {
                tracing::debug!(
                    model = %model.model,
                    session_id = %session_id,
                    backend_id = %backend_id,
                    "Dropping affinity mapping to a missing or disabled backend"
                );
                self.mappings.remove(&key);
                None
            }
        }
    }

    /// Upsert the mapping for a session. Best-effort by contract; this
    /// implementation cannot fail, store-backed ones log and swallow.
    pub fn set_affinity_backend(&self, model: &str, session_id: &str, backend_id: &str) {
        let now = Utc::now();
        self.mappings
            .entry((model.to_string(), session_id.to_string()))
            .and_modify(|m| {
                m.backend_id = backend_id.to_string();
                m.last_accessed_at = now;
                m.access_count += 1;
            })
            .or_insert_with(|| AffinityMapping {
                model: model.to_string(),
                session_id: session_id.to_string(),
                backend_id: backend_id.to_string(),
                created_at: now,
                last_accessed_at: now,
                access_count: 1,
            });
    }

    /// Delete mappings matching the filter; returns how many were removed.
    pub fn clear_mappings(&self, filter: &AffinityFilter) -> Result<usize, AffinityError> {
        if filter.is_empty() {
            return Err(AffinityError::EmptyFilter);
        }
        let before = self.mappings.len();
        self.mappings.retain(|_, mapping| !filter.matches(mapping));
        Ok(before - self.mappings.len())
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Drop mappings idle past the TTL. The server runs this periodically;
    /// reads also evict lazily so a stale hit can never be served.
    pub fn sweep(&self) -> usize {
        let horizon = Utc::now() - Duration::seconds(MAPPING_TTL_SECS);
        let before = self.mappings.len();
        self.mappings.retain(|_, m| m.last_accessed_at >= horizon);
        let removed = before - self.mappings.len();
        if removed > 0 {
            tracing::debug!(removed, "Swept stale affinity mappings");
        }
        removed
    }
}
