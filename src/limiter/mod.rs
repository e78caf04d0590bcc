//! Concurrency limiter: thin facade over the active-request store.
//!
//! Two distinct failure policies live here. Acquisition errors fail OPEN:
//! a broken store must never reject traffic, denial is reserved for the
//! explicit capacity path. Release errors are logged and swallowed.

use crate::config::schema::BackendConfig;
use crate::store::ActiveRequestStore;
use std::sync::Arc;

/// Per-backend slot acquisition, shared across all requests.
pub struct ConcurrencyLimiter {
    store: Option<Arc<dyn ActiveRequestStore>>,
}

impl ConcurrencyLimiter {
    pub fn new(store: Option<Arc<dyn ActiveRequestStore>>) -> Self {
        Self { store }
    }

    /// Limiter with no backing store: every acquisition succeeds.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Try to take a slot on `backend` for this request. Returns false only
    /// when the store explicitly reports the backend at capacity.
    pub async fn try_acquire(&self, backend: &BackendConfig, request_id: &str) -> bool {
        let Some(store) = &self.store else {
            return true;
        };
        match store
            .try_record_start(&backend.id, request_id, backend.max_concurrent_requests)
            .await
        {
            Ok(granted) => granted,
            Err(e) => {
                tracing::warn!(
                    backend_id = %backend.id,
                    request_id = %request_id,
                    error = %e,
                    "Slot store error, failing open"
                );
                true
            }
        }
    }

    /// Give the slot back. Safe to call for never-acquired ids.
    pub async fn release(&self, backend_id: &str, request_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.record_complete(backend_id, request_id).await {
            tracing::warn!(
                backend_id = %backend_id,
                request_id = %request_id,
                error = %e,
                "Failed to release slot"
            );
        }
    }
}

/// Scoped slot ownership for one dispatch attempt.
///
/// Terminal paths call [`SlotGuard::release`] explicitly; if the guard is
/// dropped without that (client disconnect, panic unwind), the release is
/// spawned so the slot still comes back exactly once.
pub struct SlotGuard {
    limiter: Arc<ConcurrencyLimiter>,
    backend_id: String,
    request_id: String,
    released: bool,
}

impl SlotGuard {
    pub fn new(limiter: Arc<ConcurrencyLimiter>, backend_id: String, request_id: String) -> Self {
        Self {
            limiter,
            backend_id,
            request_id,
            released: false,
        }
    }

    /// Release the slot now, on the calling task.
    ///
    /// Marked released only after the store call returns, so cancellation
    /// mid-release falls through to the drop path. Release is idempotent,
    /// the slot cannot leak or double-free either way.
    pub async fn release(mut self) {
        self.limiter
            .release(&self.backend_id, &self.request_id)
            .await;
        self.released = true;
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.released {
            let limiter = self.limiter.clone();
            let backend_id = std::mem::take(&mut self.backend_id);
            let request_id = std::mem::take(&mut self.request_id);
            tokio::spawn(async move {
                limiter.release(&backend_id, &request_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ProviderConfig, ProviderKind};
    use crate::instance::InstanceId;
    use crate::store::memory::MemoryActiveRequestStore;
    use crate::store::{ActiveRequestStore, StoreError};
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn backend(max: u32) -> BackendConfig {
        BackendConfig {
            id: "b".into(),
            provider: ProviderKind::Openai,
            provider_config: ProviderConfig::Openai {
                url: "https://api.openai.com".into(),
                api_key: "sk".into(),
            },
            weight: 1,
            enabled: true,
            model_override: None,
            streaming_ttft_timeout_ms: None,
            non_streaming_ttft_timeout_ms: None,
            record_requests: false,
            max_concurrent_requests: max,
        }
    }

    /// Store whose every operation fails, for the fail-open branch.
    struct BrokenStore;

    #[async_trait]
    impl ActiveRequestStore for BrokenStore {
        async fn try_record_start(&self, _: &str, _: &str, _: u32) -> Result<bool, StoreError> {
            Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
        async fn record_start(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Ok(())
        }
        async fn record_complete(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))))
        }
        async fn get_count(&self, _: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
        async fn get_all_counts(&self) -> Result<HashMap<String, usize>, StoreError> {
            Ok(HashMap::new())
        }
        async fn cleanup(&self, _: &str) -> Result<usize, StoreError> {
            Ok(0)
        }
        async fn shutdown(&self) -> Result<usize, StoreError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_no_store_always_grants() {
        let limiter = ConcurrencyLimiter::disabled();
        assert!(limiter.try_acquire(&backend(1), "r1").await);
        assert!(limiter.try_acquire(&backend(1), "r2").await);
    }

    #[tokio::test]
    async fn test_capacity_denial() {
        let store = Arc::new(MemoryActiveRequestStore::new(InstanceId::fixed("i")));
        let limiter = ConcurrencyLimiter::new(Some(store));
        assert!(limiter.try_acquire(&backend(1), "r1").await);
        assert!(!limiter.try_acquire(&backend(1), "r2").await);

        limiter.release("b", "r1").await;
        assert!(limiter.try_acquire(&backend(1), "r2").await);
    }

    #[tokio::test]
    async fn test_storage_error_fails_open() {
        let limiter = ConcurrencyLimiter::new(Some(Arc::new(BrokenStore)));
        assert!(limiter.try_acquire(&backend(1), "r1").await);
        // release errors are swallowed
        limiter.release("b", "r1").await;
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let store = Arc::new(MemoryActiveRequestStore::new(InstanceId::fixed("i")));
        let limiter = Arc::new(ConcurrencyLimiter::new(Some(store.clone())));

        assert!(limiter.try_acquire(&backend(1), "r1").await);
        let guard = SlotGuard::new(limiter.clone(), "b".into(), "r1".into());
        drop(guard);

        // drop spawns the release; give it a tick
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.get_count("b").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_guard_explicit_release_is_exact() {
        let store = Arc::new(MemoryActiveRequestStore::new(InstanceId::fixed("i")));
        let limiter = Arc::new(ConcurrencyLimiter::new(Some(store.clone())));

        assert!(limiter.try_acquire(&backend(2), "r1").await);
        let guard = SlotGuard::new(limiter.clone(), "b".into(), "r1".into());
        guard.release().await;
        assert_eq!(store.get_count("b").await.unwrap(), 0);
    }
}
