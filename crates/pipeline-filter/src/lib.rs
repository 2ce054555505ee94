// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use pipeline_broker::{HandlerContext, MessageHandler};
use pipeline_control::ReloadHandler;
use pipeline_envelope::{FallbackPolicy, FilterRule, MessageEnvelope, ServiceType};
use pipeline_error::PipelineError;
use pipeline_expr::{compile, evaluate_filter, CompiledExpr, EvalContext, Schema};
use pipeline_repository::FilterRuleRepository;
use pipeline_telemetry::PipelineMetrics;
use tracing::warn;

/// A filter rule with its expression already compiled, so evaluation never
/// pays the parse cost per envelope.
struct CompiledRule {
    id: String,
    compiled: CompiledExpr,
}

/// The active rule set, already in canonical evaluation order
/// (descending priority, ascending `created_at`).
struct RuleSnapshot {
    rules: Vec<CompiledRule>,
}

/// Outcome of evaluating an envelope against the active rule snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Whether the envelope passed every rule.
    pub passed: bool,
    /// Ids of the rules that matched before the decision was made. Always
    /// exhaustive (every rule) when `passed` is true, a prefix otherwise.
    pub applied_rule_ids: Vec<String>,
}

/// Evaluates envelopes against a live-reloadable filter rule snapshot.
pub struct FilterStage {
    repository: Arc<dyn FilterRuleRepository>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
    fallback: FallbackPolicy,
    metrics: Arc<PipelineMetrics>,
}

impl FilterStage {
    /// Build a stage with an empty rule set; call [`FilterStage::reload`]
    /// (or run it behind a [`pipeline_control::ControlConsumer`]) to
    /// populate it before serving traffic.
    pub fn new(
        repository: Arc<dyn FilterRuleRepository>,
        fallback: FallbackPolicy,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            repository,
            snapshot: RwLock::new(Arc::new(RuleSnapshot { rules: Vec::new() })),
            fallback,
            metrics,
        }
    }

    /// Re-read the active rule set from the repository, compile each
    /// expression, and atomically install the new snapshot. Rules that
    /// fail to compile are dropped with a warning rather than poisoning
    /// the whole reload; an all-compile-failure reload still installs an
    /// (empty) snapshot rather than leaving stale rules silently wrong.
    pub async fn reload(&self) -> Result<(), PipelineError> {
        let rules = self.repository.load_active_rules().await?;
        let compiled = compile_rules(rules);
        *self.snapshot.write().expect("filter snapshot lock poisoned") =
            Arc::new(RuleSnapshot { rules: compiled });
        Ok(())
    }

    /// Evaluate `envelope` against the current snapshot per the filter
    /// stage's conjunctive, priority-ordered algorithm.
    pub fn evaluate(&self, envelope: &MessageEnvelope) -> Result<FilterOutcome, PipelineError> {
        let snapshot = Arc::clone(&self.snapshot.read().expect("filter snapshot lock poisoned"));

        let id = envelope.id.as_str();
        let source = envelope.source.as_str();
        let timestamp = envelope.timestamp.to_rfc3339();
        let payload = serde_json::Value::Object(envelope.payload.clone());
        let metadata = serde_json::to_value(&envelope.metadata)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        let ctx = EvalContext {
            id,
            source,
            timestamp: &timestamp,
            payload: &payload,
            metadata: &metadata,
            source_data: None,
        };

        let mut applied = Vec::new();
        for rule in &snapshot.rules {
            match evaluate_filter(&rule.compiled, &ctx) {
                Ok(true) => {
                    applied.push(rule.id.clone());
                    self.metrics.record_filter_evaluation(&rule.id, true);
                }
                Ok(false) => {
                    self.metrics.record_filter_evaluation(&rule.id, false);
                    return Ok(FilterOutcome {
                        passed: false,
                        applied_rule_ids: applied,
                    });
                }
                Err(e) => {
                    warn!(rule_id = %rule.id, error = %e, "filter rule runtime error, applying fallback policy");
                    match self.fallback {
                        FallbackPolicy::Allow => continue,
                        FallbackPolicy::Deny => {
                            return Ok(FilterOutcome {
                                passed: false,
                                applied_rule_ids: applied,
                            });
                        }
                    }
                }
            }
        }

        Ok(FilterOutcome {
            passed: true,
            applied_rule_ids: applied,
        })
    }
}

fn compile_rules(rules: Vec<FilterRule>) -> Vec<CompiledRule> {
    rules
        .into_iter()
        .filter_map(|rule| match compile(&rule.expression, Schema::Filter) {
            Ok(compiled) => Some(CompiledRule {
                id: rule.id,
                compiled,
            }),
            Err(e) => {
                warn!(rule_id = %rule.id, error = %e, "dropping filter rule with uncompilable expression");
                None
            }
        })
        .collect()
}

#[async_trait]
impl MessageHandler for FilterStage {
    async fn handle(
        &self,
        mut envelope: MessageEnvelope,
        _ctx: &HandlerContext,
    ) -> Result<Option<MessageEnvelope>, PipelineError> {
        let outcome = self.evaluate(&envelope)?;
        self.metrics
            .record_message(if outcome.passed { "filtered_pass" } else { "filtered_drop" });
        if !outcome.passed {
            return Ok(None);
        }
        envelope.mark_filtered(outcome.applied_rule_ids, Utc::now());
        Ok(Some(envelope))
    }
}

#[async_trait]
impl ReloadHandler for FilterStage {
    fn service_type(&self) -> ServiceType {
        ServiceType::Filter
    }

    async fn on_control_event(
        &self,
        _event: &pipeline_envelope::ControlEvent,
    ) -> Result<(), PipelineError> {
        FilterStage::reload(self).await
    }

    async fn on_periodic_tick(&self) -> Result<(), PipelineError> {
        FilterStage::reload(self).await
    }
}
