//! Caller and admin authentication.
//!
//! Caller auth resolves a bearer token to an [`ApiKeyInfo`] through the
//! key store, touching `last_used_at` on the way. Admin auth is a
//! shared-secret list loaded once from the environment.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::config::schema::ProxyConfig;

/// Resolved caller credential, attached to the request for authorization.
#[derive(Debug, Clone)]
pub struct ApiKeyInfo {
    pub key: String,
    pub description: String,
    /// Model names this caller may use.
    pub models: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyInfo {
    pub fn allows_model(&self, model: &str) -> bool {
        self.models.contains(model)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential store could not be reached; callers get a 503, not a
    /// 401, because the key may well be valid.
    #[error("api key store unavailable: {0}")]
    Unavailable(String),
}

/// Lookup surface for caller credentials.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Resolve a bearer token. `Ok(None)` means unknown key. A successful
    /// lookup records the use.
    async fn authenticate(&self, token: &str) -> Result<Option<ApiKeyInfo>, AuthError>;
}

#[derive(Debug)]
struct KeyEntry {
    description: String,
    models: HashSet<String>,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

/// Key store reconciled from config snapshots.
///
/// Runtime bookkeeping (`created_at`, `last_used_at`) survives reloads for
/// keys that remain configured.
#[derive(Debug, Default)]
pub struct RegistryApiKeyStore {
    keys: DashMap<String, KeyEntry>,
}

impl RegistryApiKeyStore {
    pub fn new(config: &ProxyConfig) -> Arc<Self> {
        let store = Arc::new(Self::default());
        store.reconcile(config);
        store
    }

    /// Apply a new config snapshot: insert new keys, refresh metadata on
    /// surviving ones, drop removed ones.
    pub fn reconcile(&self, config: &ProxyConfig) {
        let configured: HashSet<&str> = config.api_keys.iter().map(|k| k.key.as_str()).collect();
        self.keys.retain(|key, _| configured.contains(key.as_str()));

        for api_key in &config.api_keys {
            let models: HashSet<String> = api_key.models.iter().cloned().collect();
            self.keys
                .entry(api_key.key.clone())
                .and_modify(|entry| {
                    entry.description = api_key.description.clone();
                    entry.models = models.clone();
                })
                .or_insert_with(|| KeyEntry {
                    description: api_key.description.clone(),
                    models,
                    created_at: Utc::now(),
                    last_used_at: None,
                });
        }
    }
}

#[async_trait]
impl ApiKeyStore for RegistryApiKeyStore {
    async fn authenticate(&self, token: &str) -> Result<Option<ApiKeyInfo>, AuthError> {
        let Some(mut entry) = self.keys.get_mut(token) else {
            return Ok(None);
        };
        entry.last_used_at = Some(Utc::now());
        Ok(Some(ApiKeyInfo {
            key: token.to_string(),
            description: entry.description.clone(),
            models: entry.models.clone(),
            created_at: entry.created_at,
            last_used_at: entry.last_used_at,
        }))
    }
}

/// Admin shared-secret check.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    tokens: Vec<String>,
}

impl AdminAuth {
    pub fn new(tokens: Vec<String>) -> Self {
        if tokens.is_empty() {
            tracing::warn!(
                "ADMIN_APIKEYS is empty: admin authentication is DISABLED. \
                 Every admin request will be accepted."
            );
        }
        Self { tokens }
    }

    /// True when the request may use the admin surface.
    pub fn check(&self, bearer: Option<&str>) -> bool {
        if self.tokens.is_empty() {
            return true;
        }
        match bearer {
            Some(token) => self.tokens.iter().any(|t| t == token),
            None => false,
        }
    }
}

/// Extract a well-formed `Authorization: Bearer <token>` value.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ApiKeyConfig;

    fn config(keys: Vec<(&str, Vec<&str>)>) -> ProxyConfig {
        ProxyConfig {
            models: vec![],
            api_keys: keys
                .into_iter()
                .map(|(key, models)| ApiKeyConfig {
                    key: key.into(),
                    description: String::new(),
                    models: models.into_iter().map(String::from).collect(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_authenticate_touches_last_used() {
        let store = RegistryApiKeyStore::new(&config(vec![("k1", vec!["gpt-4"])]));

        let first = store.authenticate("k1").await.unwrap().unwrap();
        assert!(first.last_used_at.is_some());
        assert!(first.allows_model("gpt-4"));
        assert!(!first.allows_model("claude-3"));

        assert!(store.authenticate("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reconcile_keeps_bookkeeping_for_surviving_keys() {
        let store = RegistryApiKeyStore::new(&config(vec![("k1", vec!["gpt-4"])]));
        let before = store.authenticate("k1").await.unwrap().unwrap();

        store.reconcile(&config(vec![("k1", vec!["gpt-4", "claude-3"]), ("k2", vec!["gpt-4"])]));

        let after = store.authenticate("k1").await.unwrap().unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert!(after.allows_model("claude-3"));
        assert!(store.authenticate("k2").await.unwrap().is_some());

        store.reconcile(&config(vec![("k2", vec!["gpt-4"])]));
        assert!(store.authenticate("k1").await.unwrap().is_none());
    }

    #[test]
    fn test_admin_auth_empty_list_disables() {
        let auth = AdminAuth::new(vec![]);
        assert!(auth.check(None));
        assert!(auth.check(Some("anything")));
    }

    #[test]
    fn test_admin_auth_token_match() {
        let auth = AdminAuth::new(vec!["secret-a".into(), "secret-b".into()]);
        assert!(auth.check(Some("secret-b")));
        assert!(!auth.check(Some("wrong")));
        assert!(!auth.check(None));
    }

    #[test]
    fn test_bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer tok-123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("tok-123"));

        headers.insert("authorization", "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Bearer ".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }
}
