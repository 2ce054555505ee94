// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod provider;
mod template;

pub use cache::{cache_key, EnrichmentCache, InMemoryEnrichmentCache, RedisEnrichmentCache};
pub use provider::{ApiProvider, CacheSourceProvider, EnrichmentProvider, MongoProvider, PostgresProvider};
pub use template::{substitute, substitute_json};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use pipeline_broker::{HandlerContext, MessageHandler};
use pipeline_control::ReloadHandler;
use pipeline_envelope::{ErrorHandling, MessageEnvelope, ServiceType, SourceType};
use pipeline_error::{ErrorCode, PipelineError};
use pipeline_expr::{compile, evaluate_transform, CompiledExpr, EvalContext, Schema};
use pipeline_repository::EnrichmentRuleRepository;
use pipeline_retry::CircuitBreakerRegistry;
use pipeline_telemetry::PipelineMetrics;
use serde_json::{Map, Value};
use tracing::warn;

/// An enrichment rule with every `Transformation::expression` already
/// compiled, in ascending-priority evaluation order.
struct CompiledRule {
    rule: pipeline_envelope::EnrichmentRule,
    transforms: Vec<Option<CompiledExpr>>,
}

/// The active rule set, ready for evaluation.
struct RuleSnapshot {
    rules: Vec<CompiledRule>,
}

/// The enrichment stage: for each active rule, looks up its field,
/// fetches a source record through a cached, circuit-breaker-guarded
/// provider, and writes the rule's transformations into
/// `metadata.enrichment`.
pub struct EnrichmentStage {
    repository: Arc<dyn EnrichmentRuleRepository>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    cache: Arc<dyn EnrichmentCache>,
    providers: HashMap<SourceType, Arc<dyn EnrichmentProvider>>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<PipelineMetrics>,
}

impl EnrichmentStage {
    /// Build a stage with an empty rule set; call [`EnrichmentStage::reload`]
    /// (or run it behind a [`pipeline_control::ControlConsumer`]) to
    /// populate it before serving traffic.
    pub fn new(
        repository: Arc<dyn EnrichmentRuleRepository>,
        cache: Arc<dyn EnrichmentCache>,
        providers: HashMap<SourceType, Arc<dyn EnrichmentProvider>>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(Arc::new(RuleSnapshot { rules: Vec::new() })),
            cache,
            providers,
            breakers,
            metrics,
        }
    }

    /// Re-read the active rule set from the repository, compile every
    /// transformation expression, and atomically install the new
    /// snapshot. A rule whose expressions fail to compile is dropped
    /// with a warning rather than poisoning the whole reload.
    pub async fn reload(&self) -> Result<(), PipelineError> {
        let rules = self.repository.load_active_rules().await?;
        let compiled = rules.into_iter().filter_map(compile_rule).collect();
        *self.snapshot.write().expect("enrichment snapshot lock poisoned") =
            Arc::new(RuleSnapshot { rules: compiled });
        Ok(())
    }

    /// Run every active rule against `envelope`, writing derived fields
    /// into its `metadata.enrichment` map in place.
    pub async fn enrich(&self, envelope: &mut MessageEnvelope) -> Result<(), PipelineError> {
        let snapshot = Arc::clone(&self.snapshot.read().expect("enrichment snapshot lock poisoned"));

        for compiled in &snapshot.rules {
            match self.apply_rule(compiled, envelope).await {
                Ok(()) => {}
                Err(e) if compiled.rule.error_handling == ErrorHandling::Fail => return Err(e),
                Err(e) => {
                    warn!(
                        rule_id = %compiled.rule.id,
                        error = %e,
                        "enrichment rule failed, continuing per its error_handling policy"
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply_rule(
        &self,
        compiled: &CompiledRule,
        envelope: &mut MessageEnvelope,
    ) -> Result<(), PipelineError> {
        let rule = &compiled.rule;

        let field_value = match envelope.payload.get(&rule.field_to_enrich) {
            Some(v) => value_as_lookup_key(v),
            None => return Ok(()),
        };

        let record = match self.resolve_record(rule, &field_value).await {
            Ok(record) => {
                self.metrics.record_enrichment_outcome(&rule.id, "fetched");
                record
            }
            Err(e) => {
                self.metrics.record_enrichment_outcome(&rule.id, "fetch_failed");
                match &rule.fallback_value {
                    Some(fallback) => Value::Object(Map::from_iter([(
                        "value".to_string(),
                        fallback.clone(),
                    )])),
                    None => match rule.error_handling {
                        ErrorHandling::Fail => return Err(e),
                        ErrorHandling::SkipRule | ErrorHandling::SkipField => return Ok(()),
                    },
                }
            }
        };

        for (transformation, compiled_expr) in rule.transformations.iter().zip(&compiled.transforms) {
            let outcome = self.apply_transformation(rule, transformation, compiled_expr, envelope, &record);
            if let Err(e) = outcome {
                match rule.error_handling {
                    ErrorHandling::Fail => return Err(e),
                    ErrorHandling::SkipField => {
                        if let Some(default) = &transformation.default {
                            envelope
                                .enrichment_entry()
                                .insert(transformation.target_field.clone(), default.clone());
                        }
                    }
                    ErrorHandling::SkipRule => {
                        warn!(rule_id = %rule.id, target = %transformation.target_field, error = %e, "abandoning remaining transformations for rule");
                        return Ok(());
                    }
                }
            }
        }

        Ok(())
    }

    fn apply_transformation(
        &self,
        rule: &pipeline_envelope::EnrichmentRule,
        transformation: &pipeline_envelope::Transformation,
        compiled_expr: &Option<CompiledExpr>,
        envelope: &mut MessageEnvelope,
        record: &Value,
    ) -> Result<(), PipelineError> {
        let source_value = resolve_source_path(&transformation.source_path, record);

        let resolved = match (&source_value, &transformation.default) {
            (Some(v), _) => v.clone(),
            (None, Some(default)) => default.clone(),
            (None, None) => return Ok(()),
        };

        let value = match compiled_expr {
            Some(expr) => {
                let id = envelope.id.clone();
                let source = envelope.source.clone();
                let timestamp = envelope.timestamp.to_rfc3339();
                let payload = Value::Object(envelope.payload.clone());
                let metadata = serde_json::to_value(&envelope.metadata).unwrap_or(Value::Object(Map::new()));
                let ctx = EvalContext {
                    id: &id,
                    source: &source,
                    timestamp: &timestamp,
                    payload: &payload,
                    metadata: &metadata,
                    source_data: Some(&resolved),
                };
                evaluate_transform(expr, &ctx).map_err(|e| e.with_context("rule_id", rule.id.clone()))?
            }
            None => resolved,
        };

        if !value.is_null() {
            envelope
                .enrichment_entry()
                .insert(transformation.target_field.clone(), value);
        }
        Ok(())
    }

    async fn resolve_record(
        &self,
        rule: &pipeline_envelope::EnrichmentRule,
        field_value: &str,
    ) -> Result<Value, PipelineError> {
        let key = cache_key(&rule.id, field_value);
        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                self.metrics.record_cache_outcome("enrichment", "hit");
                return Ok(cached);
            }
            Ok(None) => self.metrics.record_cache_outcome("enrichment", "miss"),
            Err(e) => {
                warn!(error = %e, "enrichment cache unavailable, falling through to provider");
                self.metrics.record_cache_outcome("enrichment", "unavailable");
            }
        }

        let provider = self.providers.get(&rule.source_type).ok_or_else(|| {
            PipelineError::new(
                ErrorCode::SourceTypeUnknown,
                format!("no provider registered for source_type {:?}", rule.source_type),
            )
        })?;
        let provider = Arc::clone(provider);
        let breaker_name = breaker_name(rule.source_type);
        let breaker = self.breakers.get_or_create(breaker_name);
        self.metrics
            .set_circuit_breaker_state(breaker_name, breaker.state_code());

        let rule_owned = rule.clone();
        let field_value_owned = field_value.to_string();
        let record = breaker
            .call(|| async move { provider.fetch(&rule_owned, &field_value_owned).await })
            .await?;
        self.metrics
            .set_circuit_breaker_state(breaker_name, breaker.state_code());

        if let Err(e) = self.cache.set(&key, &record, rule.cache_ttl_seconds).await {
            warn!(error = %e, "failed to populate enrichment cache, continuing without it");
        }

        Ok(record)
    }
}

fn breaker_name(source_type: SourceType) -> &'static str {
    match source_type {
        SourceType::Api => "enrichment-api",
        SourceType::Mongodb => "enrichment-mongodb",
        SourceType::Postgresql => "enrichment-postgresql",
        SourceType::Cache => "enrichment-cache",
    }
}

fn value_as_lookup_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn resolve_source_path(source_path: &str, record: &Value) -> Option<Value> {
    if source_path == "." {
        return Some(record.clone());
    }
    record.get(source_path).cloned()
}

fn compile_rule(rule: pipeline_envelope::EnrichmentRule) -> Option<CompiledRule> {
    let mut transforms = Vec::with_capacity(rule.transformations.len());
    for transformation in &rule.transformations {
        match &transformation.expression {
            Some(expr) => match compile(expr, Schema::Transform) {
                Ok(compiled) => transforms.push(Some(compiled)),
                Err(e) => {
                    warn!(
                        rule_id = %rule.id,
                        target = %transformation.target_field,
                        error = %e,
                        "dropping enrichment rule with uncompilable transformation expression"
                    );
                    return None;
                }
            },
            None => transforms.push(None),
        }
    }
    Some(CompiledRule { rule, transforms })
}

#[async_trait]
impl MessageHandler for EnrichmentStage {
    async fn handle(
        &self,
        mut envelope: MessageEnvelope,
        _ctx: &HandlerContext,
    ) -> Result<Option<MessageEnvelope>, PipelineError> {
        self.enrich(&mut envelope).await?;
        self.metrics.record_message("enriched");
        Ok(Some(envelope))
    }
}

#[async_trait]
impl ReloadHandler for EnrichmentStage {
    fn service_type(&self) -> ServiceType {
        ServiceType::Enrich
    }

    async fn on_control_event(
        &self,
        _event: &pipeline_envelope::ControlEvent,
    ) -> Result<(), PipelineError> {
        EnrichmentStage::reload(self).await
    }

    async fn on_periodic_tick(&self) -> Result<(), PipelineError> {
        EnrichmentStage::reload(self).await
    }
}
