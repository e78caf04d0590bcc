//! Redis-backed active-request store for multi-instance deployments.
//!
//! One sorted set per backend, scored by epoch milliseconds. The
//! evict/check/count/insert sequence of `try_record_start` runs as a single
//! Lua script, so concurrent acquisitions from any number of proxy
//! instances are linearized by Redis. Members encode
//! `request_id|instance_id` so `cleanup` can remove everything a crashed
//! instance left behind.

use super::{ActiveRequestStore, StoreError, ENTRY_TTL};
use crate::instance::InstanceId;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

const KEY_PREFIX: &str = "active_requests:";
/// Set of backend ids with (possibly stale) slot sets, for get_all_counts
/// and cleanup scans.
const BACKENDS_KEY: &str = "active_requests:backends";

const TRY_START_SCRIPT: &str = r#"
local key = KEYS[1]
local registry = KEYS[2]
local member = ARGV[1]
local backend = ARGV[2]
local now = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local limit = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - ttl_ms)

if redis.call('ZSCORE', key, member) then
  return 1
end

if limit > 0 and redis.call('ZCARD', key) >= limit then
  return 0
end

redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, ttl_ms)
redis.call('SADD', registry, backend)
return 1
"#;

pub struct RedisActiveRequestStore {
    instance_id: InstanceId,
    connection: ConnectionManager,
    try_start: Script,
}

impl RedisActiveRequestStore {
    /// Connect to the given redis URL.
    pub async fn connect(url: &str, instance_id: InstanceId) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            instance_id,
            connection,
            try_start: Script::new(TRY_START_SCRIPT),
        })
    }

    fn key(backend_id: &str) -> String {
        format!("{KEY_PREFIX}{backend_id}")
    }

    fn member(&self, request_id: &str) -> String {
        format!("{request_id}|{}", self.instance_id.as_str())
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    async fn evicted_count(&self, backend_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        let key = Self::key(backend_id);
        let cutoff = Self::now_ms() - ENTRY_TTL.as_millis() as i64;
        let _: () = conn.zrembyscore(&key, "-inf", cutoff).await?;
        let count: usize = conn.zcard(&key).await?;
        Ok(count)
    }
}

#[async_trait]
impl ActiveRequestStore for RedisActiveRequestStore {
    async fn try_record_start(
        &self,
        backend_id: &str,
        request_id: &str,
        max_limit: u32,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let granted: i64 = self
            .try_start
            .key(Self::key(backend_id))
            .key(BACKENDS_KEY)
            .arg(self.member(request_id))
            .arg(backend_id)
            .arg(Self::now_ms())
            .arg(ENTRY_TTL.as_millis() as i64)
            .arg(max_limit as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    async fn record_start(&self, backend_id: &str, request_id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let key = Self::key(backend_id);
        let _: () = conn
            .zadd(&key, self.member(request_id), Self::now_ms())
            .await?;
        let _: () = conn.sadd(BACKENDS_KEY, backend_id).await?;
        Ok(())
    }

    async fn record_complete(
        &self,
        backend_id: &str,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn
            .zrem(Self::key(backend_id), self.member(request_id))
            .await?;
        Ok(())
    }

    async fn get_count(&self, backend_id: &str) -> Result<usize, StoreError> {
        self.evicted_count(backend_id).await
    }

    async fn get_all_counts(&self) -> Result<HashMap<String, usize>, StoreError> {
        let mut conn = self.connection.clone();
        let backends: Vec<String> = conn.smembers(BACKENDS_KEY).await?;

        let mut counts = HashMap::new();
        for backend_id in backends {
            let count = self.evicted_count(&backend_id).await?;
            if count > 0 {
                counts.insert(backend_id, count);
            }
        }
        Ok(counts)
    }

    async fn cleanup(&self, instance_id: &str) -> Result<usize, StoreError> {
        let mut conn = self.connection.clone();
        let backends: Vec<String> = conn.smembers(BACKENDS_KEY).await?;
        let suffix = format!("|{instance_id}");

        let mut removed = 0usize;
        for backend_id in backends {
            let key = Self::key(&backend_id);
            let members: Vec<String> = conn.zrange(&key, 0, -1).await?;
            let owned: Vec<&String> =
                members.iter().filter(|m| m.ends_with(&suffix)).collect();
            if !owned.is_empty() {
                let n: usize = conn.zrem(&key, owned).await?;
                removed += n;
            }
        }

        tracing::info!(
            instance_id = %instance_id,
            removed,
            "Cleaned up active-request slots"
        );
        Ok(removed)
    }

    async fn shutdown(&self) -> Result<usize, StoreError> {
        let own = self.instance_id.as_str().to_string();
        self.cleanup(&own).await
    }
}
