// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod hash;
mod store;

pub use hash::{content_hash, dedup_key, hashable_fields};
pub use store::{DedupStore, InMemoryDedupStore, RedisDedupStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pipeline_broker::{HandlerContext, MessageHandler};
use pipeline_control::ReloadHandler;
use pipeline_envelope::{ControlEvent, FallbackPolicy, MessageEnvelope, ServiceType};
use pipeline_error::PipelineError;
use pipeline_repository::{DedupConfigProvider, InMemoryDedupConfigStore};
use pipeline_telemetry::PipelineMetrics;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// The dedup stage: computes a content hash over the current
/// `fields_to_hash` snapshot and checks it against a [`DedupStore`].
pub struct DedupStage {
    store: Arc<dyn DedupStore>,
    config: Arc<InMemoryDedupConfigStore>,
    metrics: Arc<PipelineMetrics>,
}

impl DedupStage {
    pub fn new(
        store: Arc<dyn DedupStore>,
        config: Arc<InMemoryDedupConfigStore>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Evaluate uniqueness for `envelope` per `spec.md` §4.5: build the
    /// hashable field mapping, hash the configured fields in order, and
    /// issue an atomic set-if-absent against the TTL store.
    pub async fn process(&self, envelope: &MessageEnvelope) -> Result<bool, PipelineError> {
        let config = self.config.current();
        let fields = hashable_fields(envelope);
        let hash = content_hash(&fields, &config.fields_to_hash, config.hash_algorithm);
        let key = dedup_key(&hash);
        let now_secs = Utc::now().timestamp().to_string();

        match self
            .store
            .set_if_absent(&key, &now_secs, Duration::from_secs(config.ttl_seconds))
            .await
        {
            Ok(is_unique) => {
                self.metrics
                    .record_dedup_outcome(if is_unique { "unique" } else { "duplicate" });
                Ok(is_unique)
            }
            Err(e) => match config.on_redis_error {
                FallbackPolicy::Allow => {
                    warn!(error = %e, "dedup store error, treating as unique (fail-open)");
                    self.metrics.record_dedup_outcome("store_error_fail_open");
                    Ok(true)
                }
                FallbackPolicy::Deny => Err(e),
            },
        }
    }

    /// Spawn the background key-count sampler. Exits when `cancel` fires;
    /// never blocks [`DedupStage::process`] since it only ever reads the
    /// store on its own schedule.
    pub fn spawn_key_count_sampler(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let stage = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        match stage.store.approximate_key_count().await {
                            Ok(count) => {
                                stage.metrics.observe_stage_latency("key_count_sample", count as f64);
                            }
                            Err(e) => warn!(error = %e, "dedup key-count sample failed"),
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl MessageHandler for DedupStage {
    async fn handle(
        &self,
        mut envelope: MessageEnvelope,
        _ctx: &HandlerContext,
    ) -> Result<Option<MessageEnvelope>, PipelineError> {
        let is_unique = self.process(&envelope).await?;
        self.metrics
            .record_message(if is_unique { "dedup_pass" } else { "dedup_drop" });
        if !is_unique {
            return Ok(None);
        }
        envelope.mark_deduplicated(true, Utc::now());
        Ok(Some(envelope))
    }
}

#[async_trait]
impl ReloadHandler for DedupStage {
    fn service_type(&self) -> ServiceType {
        ServiceType::Dedup
    }

    /// Dedup config has no durable store of its own (per `spec.md` §4.5);
    /// the new value travels in the event's own `metadata`, parsed as a
    /// [`pipeline_envelope::DedupConfig`]. Unparseable metadata leaves the
    /// previous snapshot untouched.
    async fn on_control_event(&self, event: &ControlEvent) -> Result<(), PipelineError> {
        let new_config = serde_json::from_value::<pipeline_envelope::DedupConfig>(
            serde_json::Value::Object(event.metadata.clone()),
        )
        .map_err(|e| {
            PipelineError::new(
                pipeline_error::ErrorCode::ConfigInvalid,
                format!("dedup config update event did not parse: {e}"),
            )
        })?;
        self.config.replace(new_config);
        Ok(())
    }

    /// Dedup config only ever changes via an event; there is nothing else
    /// to poll, so the periodic safety net is a no-op.
    async fn on_periodic_tick(&self) -> Result<(), PipelineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_envelope::{Action, EventType, HashAlgorithm};
    use serde_json::{json, Map};

    fn stage() -> DedupStage {
        DedupStage::new(
            Arc::new(InMemoryDedupStore::new()),
            Arc::new(InMemoryDedupConfigStore::new(
                pipeline_envelope::DedupConfig::default(),
            )),
            Arc::new(PipelineMetrics::new("dedup-test").unwrap()),
        )
    }

    fn envelope(id: &str) -> MessageEnvelope {
        MessageEnvelope::new(id, "orders", Utc::now(), Map::new())
    }

    #[tokio::test]
    async fn first_occurrence_is_unique() {
        let stage = stage();
        assert!(stage.process(&envelope("m1")).await.unwrap());
    }

    #[tokio::test]
    async fn repeat_occurrence_is_duplicate() {
        let stage = stage();
        stage.process(&envelope("m1")).await.unwrap();
        assert!(!stage.process(&envelope("m1")).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_ids_are_both_unique() {
        let stage = stage();
        assert!(stage.process(&envelope("m1")).await.unwrap());
        assert!(stage.process(&envelope("m2")).await.unwrap());
    }

    #[tokio::test]
    async fn handle_marks_deduplicated_on_pass() {
        let stage = stage();
        let ctx = HandlerContext {
            trace_ctx: Default::default(),
            source_topic: "orders.filtered".to_string(),
        };
        let forwarded = stage.handle(envelope("m1"), &ctx).await.unwrap().unwrap();
        assert!(forwarded.metadata.deduplication.unwrap().is_unique);
    }

    #[tokio::test]
    async fn handle_drops_duplicate() {
        let stage = stage();
        let ctx = HandlerContext {
            trace_ctx: Default::default(),
            source_topic: "orders.filtered".to_string(),
        };
        stage.handle(envelope("m1"), &ctx).await.unwrap();
        let second = stage.handle(envelope("m1"), &ctx).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn control_event_replaces_fields_to_hash() {
        let stage = stage();
        let new_config = pipeline_envelope::DedupConfig {
            hash_algorithm: HashAlgorithm::Sha256,
            ttl_seconds: 900,
            on_redis_error: FallbackPolicy::Deny,
            fields_to_hash: vec!["id".to_string()],
        };
        let metadata = match serde_json::to_value(&new_config).unwrap() {
            serde_json::Value::Object(m) => m,
            _ => unreachable!(),
        };
        let event = ControlEvent {
            event_type: EventType::DedupConfigUpdated,
            service_type: ServiceType::Dedup,
            action: Action::Update,
            rule_id: None,
            timestamp: Utc::now(),
            changed_by: Some("operator".to_string()),
            metadata,
        };
        stage.on_control_event(&event).await.unwrap();
        let current = stage.config.current();
        assert_eq!(current.fields_to_hash, vec!["id".to_string()]);
        assert_eq!(current.ttl_seconds, 900);
    }

    #[tokio::test]
    async fn unparseable_control_event_returns_error() {
        let stage = stage();
        let event = ControlEvent {
            event_type: EventType::DedupConfigUpdated,
            service_type: ServiceType::Dedup,
            action: Action::Update,
            rule_id: None,
            timestamp: Utc::now(),
            changed_by: None,
            metadata: {
                let mut m = Map::new();
                m.insert("not_a_valid_field".to_string(), json!(true));
                m
            },
        };
        assert!(stage.on_control_event(&event).await.is_err());
    }

    #[test]
    fn service_type_is_dedup() {
        let stage = stage();
        assert_eq!(
            <DedupStage as ReloadHandler>::service_type(&stage),
            ServiceType::Dedup
        );
    }
}
