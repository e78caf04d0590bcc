//! Single-instance active-request store.
//!
//! The compound evict/check/insert step runs under one mutex, which is the
//! whole atomicity story for a single process. Multi-instance deployments
//! use the redis store instead.

use super::{ActiveRequestStore, StoreError, ENTRY_TTL};
use crate::instance::InstanceId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    instance_id: String,
    started_at: Instant,
}

/// In-memory slot tracking, keyed backend → request.
#[derive(Debug)]
pub struct MemoryActiveRequestStore {
    instance_id: InstanceId,
    backends: Mutex<HashMap<String, HashMap<String, Entry>>>,
}

impl MemoryActiveRequestStore {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            backends: Mutex::new(HashMap::new()),
        }
    }

    fn evict_expired(entries: &mut HashMap<String, Entry>) {
        entries.retain(|_, e| e.started_at.elapsed() < ENTRY_TTL);
    }
}

#[async_trait]
impl ActiveRequestStore for MemoryActiveRequestStore {
    async fn try_record_start(
        &self,
        backend_id: &str,
        request_id: &str,
        max_limit: u32,
    ) -> Result<bool, StoreError> {
        let mut backends = self.backends.lock().unwrap();
        let entries = backends.entry(backend_id.to_string()).or_default();
        Self::evict_expired(entries);

        if entries.contains_key(request_id) {
            return Ok(true);
        }
        if max_limit > 0 && entries.len() >= max_limit as usize {
            return Ok(false);
        }
        entries.insert(
            request_id.to_string(),
            Entry {
                instance_id: self.instance_id.as_str().to_string(),
                started_at: Instant::now(),
            },
        );
        Ok(true)
    }

    async fn record_start(&self, backend_id: &str, request_id: &str) -> Result<(), StoreError> {
        let mut backends = self.backends.lock().unwrap();
        backends.entry(backend_id.to_string()).or_default().insert(
            request_id.to_string(),
            Entry {
                instance_id: self.instance_id.as_str().to_string(),
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn record_complete(
        &self,
        backend_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut backends = self.backends.lock().unwrap();
        if let Some(entries) = backends.get_mut(backend_id) {
            entries.remove(request_id);
        }
        Ok(())
    }

    async fn get_count(&self, backend_id: &str) -> Result<usize, StoreError> {
        let mut backends = self.backends.lock().unwrap();
        Ok(backends
            .get_mut(backend_id)
            .map(|entries| {
                Self::evict_expired(entries);
                entries.len()
            })
            .unwrap_or(0))
    }

    async fn get_all_counts(&self) -> Result<HashMap<String, usize>, StoreError> {
        let mut backends = self.backends.lock().unwrap();
        let mut counts = HashMap::new();
        for (backend_id, entries) in backends.iter_mut() {
            Self::evict_expired(entries);
            if !entries.is_empty() {
                counts.insert(backend_id.clone(), entries.len());
            }
        }
        Ok(counts)
    }

    async fn cleanup(&self, instance_id: &str) -> Result<usize, StoreError> {
        let mut backends = self.backends.lock().unwrap();
        let mut removed = 0;
        for entries in backends.values_mut() {
            let before = entries.len();
            entries.retain(|_, e| e.instance_id != instance_id);
            removed += before - entries.len();
        }
        Ok(removed)
    }

    async fn shutdown(&self) -> Result<usize, StoreError> {
        let own = self.instance_id.as_str().to_string();
        self.cleanup(&own).await
    }
}
