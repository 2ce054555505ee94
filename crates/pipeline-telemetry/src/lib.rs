// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Prometheus metrics registry and structured tracing spans for a pipeline
//! stage service (filter, dedup, or enrich).

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

// ---------------------------------------------------------------------------
// PipelineMetrics
// ---------------------------------------------------------------------------

/// The metrics a stage service exposes on its `/metrics` endpoint.
///
/// One [`PipelineMetrics`] is created per service process at startup and
/// shared (behind an `Arc`) with every component that produces outcomes:
/// the filter/dedup/enrich stage loop, the enrichment providers, and the
/// circuit breakers guarding external dependencies.
pub struct PipelineMetrics {
    registry: Registry,
    messages_total: IntCounterVec,
    filter_evaluations_total: IntCounterVec,
    dedup_outcomes_total: IntCounterVec,
    enrichment_outcomes_total: IntCounterVec,
    cache_outcomes_total: IntCounterVec,
    circuit_breaker_state: IntGaugeVec,
    stage_latency_seconds: HistogramVec,
}

impl PipelineMetrics {
    /// Build a fresh registry and register every metric, labelling
    /// counters with `service` (`filter`, `dedup`, or `enrich`).
    pub fn new(service: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let messages_total = IntCounterVec::new(
            Opts::new(
                "pipeline_messages_total",
                "Messages processed by a stage service, by outcome",
            )
            .const_label("service", service),
            &["outcome"],
        )?;

        let filter_evaluations_total = IntCounterVec::new(
            Opts::new(
                "pipeline_filter_evaluations_total",
                "Filter rule evaluations, by rule and result",
            ),
            &["rule_id", "result"],
        )?;

        let dedup_outcomes_total = IntCounterVec::new(
            Opts::new(
                "pipeline_dedup_outcomes_total",
                "Deduplication outcomes (unique, duplicate, store_error)",
            ),
            &["outcome"],
        )?;

        let enrichment_outcomes_total = IntCounterVec::new(
            Opts::new(
                "pipeline_enrichment_outcomes_total",
                "Enrichment rule application outcomes, by rule and result",
            ),
            &["rule_id", "outcome"],
        )?;

        let cache_outcomes_total = IntCounterVec::new(
            Opts::new(
                "pipeline_cache_outcomes_total",
                "Enrichment cache lookups, by cache name and hit/miss",
            ),
            &["cache", "outcome"],
        )?;

        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "pipeline_circuit_breaker_state",
                "Circuit breaker state per dependency (0=closed, 1=open, 2=half_open)",
            ),
            &["dependency"],
        )?;

        let stage_latency_seconds = HistogramVec::new(
            HistogramOpts::new(
                "pipeline_stage_latency_seconds",
                "End-to-end per-message latency for a stage service",
            )
            .const_label("service", service),
            &["outcome"],
        )?;

        registry.register(Box::new(messages_total.clone()))?;
        registry.register(Box::new(filter_evaluations_total.clone()))?;
        registry.register(Box::new(dedup_outcomes_total.clone()))?;
        registry.register(Box::new(enrichment_outcomes_total.clone()))?;
        registry.register(Box::new(cache_outcomes_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(stage_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            messages_total,
            filter_evaluations_total,
            dedup_outcomes_total,
            enrichment_outcomes_total,
            cache_outcomes_total,
            circuit_breaker_state,
            stage_latency_seconds,
        })
    }

    /// Count one processed message with the given outcome
    /// (`passed`, `filtered`, `duplicate`, `enriched`, `error`, ...).
    pub fn record_message(&self, outcome: &str) {
        self.messages_total.with_label_values(&[outcome]).inc();
    }

    /// Count one filter rule evaluation (`result` is `true`/`false`).
    pub fn record_filter_evaluation(&self, rule_id: &str, result: bool) {
        self.filter_evaluations_total
            .with_label_values(&[rule_id, if result { "true" } else { "false" }])
            .inc();
    }

    /// Count one dedup stage outcome (`unique`, `duplicate`, `store_error`).
    pub fn record_dedup_outcome(&self, outcome: &str) {
        self.dedup_outcomes_total.with_label_values(&[outcome]).inc();
    }

    /// Count one enrichment rule application outcome
    /// (`applied`, `skip_rule`, `skip_field`, `field_absent`, `error`).
    pub fn record_enrichment_outcome(&self, rule_id: &str, outcome: &str) {
        self.enrichment_outcomes_total
            .with_label_values(&[rule_id, outcome])
            .inc();
    }

    /// Count one enrichment cache lookup (`outcome` is `hit` or `miss`).
    pub fn record_cache_outcome(&self, cache: &str, outcome: &str) {
        self.cache_outcomes_total
            .with_label_values(&[cache, outcome])
            .inc();
    }

    /// Set the current state gauge for a named dependency's circuit
    /// breaker (0=closed, 1=open, 2=half_open).
    pub fn set_circuit_breaker_state(&self, dependency: &str, state_code: i64) {
        self.circuit_breaker_state
            .with_label_values(&[dependency])
            .set(state_code);
    }

    /// Record one message's end-to-end processing latency.
    pub fn observe_stage_latency(&self, outcome: &str, seconds: f64) {
        self.stage_latency_seconds
            .with_label_values(&[outcome])
            .observe(seconds);
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let metric_families = self.registry.gather();
        let mut buf = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| prometheus::Error::Msg(format!("non-utf8 metrics output: {e}")))
    }
}

// ---------------------------------------------------------------------------
// TelemetrySpan
// ---------------------------------------------------------------------------

/// A structured span emitted through `tracing`, used for ad-hoc
/// operation-level telemetry that doesn't warrant its own Prometheus
/// series (control-event handling, rule reloads).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySpan {
    /// Span name / operation.
    pub name: String,
    /// Arbitrary key-value attributes (deterministic ordering).
    pub attributes: BTreeMap<String, String>,
}

impl TelemetrySpan {
    /// Create a new span with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Insert an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Emit the span via `tracing::info!`.
    pub fn emit(&self) {
        info!(
            span_name = %self.name,
            attributes = ?self.attributes,
            "telemetry_span"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
