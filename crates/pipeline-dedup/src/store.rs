// SPDX-License-Identifier: MIT OR Apache-2.0
//! TTL store abstraction for dedup keys, with a Redis-backed production
//! implementation and an in-memory one for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline_error::{ErrorCode, PipelineError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// An atomic set-if-absent TTL store keyed by dedup hash.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically set `key` to `value` with `ttl` if and only if it is
    /// currently absent. Returns `true` when the key was newly set
    /// (unique), `false` when it already existed (duplicate).
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PipelineError>;

    /// Approximate number of live keys, for metrics sampling. Exactness is
    /// not required; implementations may estimate.
    async fn approximate_key_count(&self) -> Result<u64, PipelineError>;
}

/// Redis-backed [`DedupStore`] using `SET key value EX ttl NX`.
pub struct RedisDedupStore {
    conn: ConnectionManager,
}

impl RedisDedupStore {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = redis::Client::open(url).map_err(|e| {
            PipelineError::new(ErrorCode::DedupStoreError, format!("invalid redis url: {e}"))
        })?;
        let conn = client.get_connection_manager().await.map_err(|e| {
            PipelineError::new(
                ErrorCode::StoreTimeout,
                format!("failed to connect to dedup redis: {e}"),
            )
        })?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, PipelineError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(&e))?;
        Ok(result.is_some())
    }

    async fn approximate_key_count(&self) -> Result<u64, PipelineError> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.dbsize().await.map_err(|e| redis_error(&e))?;
        Ok(count)
    }
}

fn redis_error(e: &redis::RedisError) -> PipelineError {
    let code = if e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        ErrorCode::StoreTimeout
    } else {
        ErrorCode::DedupStoreError
    };
    PipelineError::new(code, format!("dedup store error: {e}"))
}

/// In-memory [`DedupStore`] for tests: a mutex-guarded map from key to
/// insertion time, with expiry checked lazily on access.
#[derive(Default)]
pub struct InMemoryDedupStore {
    entries: Mutex<HashMap<String, Instant>>,
}

impl InMemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn set_if_absent(&self, key: &str, _value: &str, ttl: Duration) -> Result<bool, PipelineError> {
        let mut entries = self.entries.lock().expect("dedup store mutex poisoned");
        let now = Instant::now();
        if let Some(inserted_at) = entries.get(key) {
            if now.duration_since(*inserted_at) < ttl {
                return Ok(false);
            }
        }
        entries.insert(key.to_string(), now);
        Ok(true)
    }

    async fn approximate_key_count(&self) -> Result<u64, PipelineError> {
        Ok(self.entries.lock().expect("dedup store mutex poisoned").len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_occurrence_is_unique() {
        let store = InMemoryDedupStore::new();
        let unique = store
            .set_if_absent("dedup:abc", "123", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(unique);
    }

    #[tokio::test]
    async fn second_occurrence_before_ttl_is_duplicate() {
        let store = InMemoryDedupStore::new();
        store
            .set_if_absent("dedup:abc", "123", Duration::from_secs(60))
            .await
            .unwrap();
        let unique = store
            .set_if_absent("dedup:abc", "124", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!unique);
    }

    #[tokio::test]
    async fn occurrence_after_ttl_expiry_is_unique_again() {
        let store = InMemoryDedupStore::new();
        store
            .set_if_absent("dedup:abc", "123", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let unique = store
            .set_if_absent("dedup:abc", "124", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(unique);
    }

    #[tokio::test]
    async fn key_count_tracks_distinct_keys() {
        let store = InMemoryDedupStore::new();
        store
            .set_if_absent("dedup:a", "1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .set_if_absent("dedup:b", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.approximate_key_count().await.unwrap(), 2);
    }
}
