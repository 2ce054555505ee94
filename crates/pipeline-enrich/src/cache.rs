// SPDX-License-Identifier: MIT OR Apache-2.0
//! Enrichment cache: a Redis-backed GET/SET of JSON-encoded fetched
//! records, keyed `enrich:<rule_id>:<field_value>`.

use async_trait::async_trait;
use pipeline_error::{ErrorCode, PipelineError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

/// Read/write access to the enrichment cache.
#[async_trait]
pub trait EnrichmentCache: Send + Sync {
    /// Fetch a cached record, if present. `Ok(None)` is a cache miss;
    /// `Err` means the cache itself is unavailable (callers should treat
    /// this the same as a miss and proceed to the provider).
    async fn get(&self, key: &str) -> Result<Option<Value>, PipelineError>;

    /// Store `value` under `key` for `ttl_seconds`. Failures are logged by
    /// the caller, never fail the rule.
    async fn set(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<(), PipelineError>;
}

/// Build the cache key for a rule/field-value pair.
pub fn cache_key(rule_id: &str, field_value: &str) -> String {
    format!("enrich:{rule_id}:{field_value}")
}

/// Redis-backed [`EnrichmentCache`].
pub struct RedisEnrichmentCache {
    conn: ConnectionManager,
}

impl RedisEnrichmentCache {
    pub async fn connect(url: &str) -> Result<Self, PipelineError> {
        let client = redis::Client::open(url).map_err(|e| {
            PipelineError::new(ErrorCode::CacheMiss, format!("invalid enrichment cache url: {e}"))
        })?;
        let conn = client.get_connection_manager().await.map_err(|e| {
            PipelineError::new(
                ErrorCode::StoreTimeout,
                format!("failed to connect to enrichment cache: {e}"),
            )
        })?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl EnrichmentCache for RedisEnrichmentCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(|e| {
            PipelineError::new(ErrorCode::CacheMiss, format!("enrichment cache GET failed: {e}"))
        })?;
        match raw {
            Some(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                PipelineError::new(
                    ErrorCode::CacheMiss,
                    format!("enrichment cache value not valid JSON: {e}"),
                )
            }),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<(), PipelineError> {
        let mut conn = self.conn.clone();
        let text = serde_json::to_string(value).map_err(|e| {
            PipelineError::new(ErrorCode::CacheMiss, format!("failed to encode cache value: {e}"))
        })?;
        let _: () = conn.set_ex(key, text, ttl_seconds).await.map_err(|e| {
            PipelineError::new(ErrorCode::CacheMiss, format!("enrichment cache SET failed: {e}"))
        })?;
        Ok(())
    }
}

/// In-memory [`EnrichmentCache`] for tests.
#[derive(Default)]
pub struct InMemoryEnrichmentCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl InMemoryEnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnrichmentCache for InMemoryEnrichmentCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, PipelineError> {
        Ok(self.entries.lock().expect("enrichment cache mutex poisoned").get(key).cloned())
    }

    async fn set(&self, key: &str, value: &Value, _ttl_seconds: u64) -> Result<(), PipelineError> {
        self.entries
            .lock()
            .expect("enrichment cache mutex poisoned")
            .insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cache_key_has_rule_and_field_value() {
        assert_eq!(cache_key("r1", "u-1"), "enrich:r1:u-1");
    }

    #[tokio::test]
    async fn miss_then_set_then_hit() {
        let cache = InMemoryEnrichmentCache::new();
        assert!(cache.get("enrich:r1:u-1").await.unwrap().is_none());
        cache.set("enrich:r1:u-1", &json!({"name": "Ada"}), 60).await.unwrap();
        let hit = cache.get("enrich:r1:u-1").await.unwrap();
        assert_eq!(hit, Some(json!({"name": "Ada"})));
    }
}
