// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and merging for the pipeline's stage
//! services.
//!
//! This crate provides [`StageConfig`] — the top-level runtime settings
//! shared by the filter, dedup, and enrich services — together with helpers
//! for loading from TOML files, applying environment variable overrides,
//! merging overlays, and producing advisory [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },

    /// Two configs could not be merged because of conflicting constraints.
    #[error("merge conflict: {reason}")]
    MergeConflict {
        /// Description of the conflict.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Warnings
// ---------------------------------------------------------------------------

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A deprecated field was used in the configuration.
    DeprecatedField {
        /// Name of the deprecated field.
        field: String,
        /// Suggested replacement, if any.
        suggestion: Option<String>,
    },
    /// A recommended optional field is missing.
    MissingOptionalField {
        /// Name of the missing field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// No DLQ topic is configured for a service.
    NoDlqConfigured {
        /// Service name.
        service: String,
    },
    /// A retry or circuit-breaker interval is unusually large.
    LargeInterval {
        /// Field name the value belongs to.
        field: String,
        /// Value in seconds.
        secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::DeprecatedField { field, suggestion } => {
                write!(f, "deprecated field '{field}'")?;
                if let Some(s) = suggestion {
                    write!(f, " — use '{s}' instead")?;
                }
                Ok(())
            }
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::NoDlqConfigured { service } => {
                write!(
                    f,
                    "service '{service}' has no dlq_topic configured; retry exhaustion will commit with a warning"
                )
            }
            ConfigWarning::LargeInterval { field, secs } => {
                write!(f, "'{field}' is unusually large ({secs}s)")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Which of the three stage services a [`StageConfig`] is bootstrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    /// The filter stage.
    Filter,
    /// The deduplication stage.
    Dedup,
    /// The enrichment stage.
    Enrich,
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Filter => "filter",
            Self::Dedup => "dedup",
            Self::Enrich => "enrich",
        };
        f.write_str(s)
    }
}

/// Broker topic names for a single stage.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TopicsConfig {
    /// Topic this stage consumes from.
    pub input_topic: String,
    /// Topic this stage publishes successfully processed envelopes to.
    pub output_topic: String,
    /// Topic carrying control events for all stages; filtered by `service_type`.
    pub config_update_topic: String,
    /// Dead-letter topic; when absent, retry-exhausted messages are committed
    /// with a warning instead of dead-lettered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dlq_topic: Option<String>,
}

/// Broker connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Comma-separated `host:port` bootstrap server list.
    pub bootstrap_servers: String,
    /// Consumer group id for this stage's data-topic consumer.
    pub consumer_group: String,
    /// Per-stage topic names.
    pub topics: TopicsConfig,
}

/// Durable store connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct StoresConfig {
    /// Postgres connection string for the filter rule repository (relational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_rules_db_url: Option<String>,
    /// MongoDB connection string for the enrichment rule repository (document).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_rules_mongo_url: Option<String>,
    /// Database name within the MongoDB deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_rules_mongo_db: Option<String>,
    /// Redis connection string for the dedup TTL store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_redis_url: Option<String>,
    /// Redis connection string for the enrichment cache (may equal
    /// `dedup_redis_url`, or point at a separate instance).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_cache_redis_url: Option<String>,
    /// PostgreSQL connection string for the `postgresql` enrichment
    /// source provider. Distinct from `filter_rules_db_url`: this is the
    /// application database rules look records up in, not the filter
    /// stage's rule store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_source_postgres_url: Option<String>,
    /// Redis connection string for the `cache` enrichment source
    /// provider (rules with `source_type = "cache"` read records
    /// directly out of Redis by key pattern). Falls back to
    /// `enrichment_cache_redis_url` when unset, since the two commonly
    /// share one instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_source_redis_url: Option<String>,
}

/// Exponential backoff retry policy, shared by every broker consumer.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct RetryConfig {
    /// Initial backoff interval, milliseconds.
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,
    /// Backoff multiplier applied after each failed attempt.
    #[serde(default = "default_multiplier_permille")]
    pub multiplier_permille: u64,
    /// Backoff interval cap, milliseconds.
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// Maximum number of attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Overall time budget across all attempts, milliseconds. `None` means
    /// unbounded (only `max_attempts` applies).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_elapsed_time_ms: Option<u64>,
}

fn default_initial_interval_ms() -> u64 {
    200
}
fn default_multiplier_permille() -> u64 {
    2000
}
fn default_max_interval_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            multiplier_permille: default_multiplier_permille(),
            max_interval_ms: default_max_interval_ms(),
            max_attempts: default_max_attempts(),
            max_elapsed_time_ms: None,
        }
    }
}

/// Circuit breaker tuning, applied per named dependency.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Minimum request count within `interval_secs` before `ready_to_trip`
    /// is consulted.
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,
    /// Failure ratio (0–100, percent) that trips the breaker once
    /// `min_requests` is satisfied.
    #[serde(default = "default_failure_ratio_pct")]
    pub failure_ratio_pct: u8,
    /// Closed-state sampling window, seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Open-state duration before transitioning to half-open, seconds.
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
    /// Maximum concurrent probe calls while half-open.
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,
}

fn default_min_requests() -> u64 {
    10
}
fn default_failure_ratio_pct() -> u8 {
    50
}
fn default_interval_secs() -> u64 {
    60
}
fn default_open_timeout_secs() -> u64 {
    30
}
fn default_half_open_max_requests() -> u32 {
    1
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            min_requests: default_min_requests(),
            failure_ratio_pct: default_failure_ratio_pct(),
            interval_secs: default_interval_secs(),
            open_timeout_secs: default_open_timeout_secs(),
            half_open_max_requests: default_half_open_max_requests(),
        }
    }
}

/// HTTP health/metrics server settings.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct HttpConfig {
    /// Bind address for the `/health` and `/metrics` endpoints.
    #[serde(default = "default_http_bind_addr")]
    pub bind_addr: String,
}

fn default_http_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_http_bind_addr(),
        }
    }
}

/// Distributed tracing export settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct TracingConfig {
    /// OTLP collector endpoint. When absent, spans are recorded locally only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub otlp_endpoint: Option<String>,
}

/// What the filter stage does when a rule's expression raises a runtime
/// error (a type mismatch, a missing operand) rather than evaluating to
/// `true`/`false`. Mirrors `pipeline_envelope::FallbackPolicy`; kept as a
/// separate type here so this crate stays independent of the envelope
/// data model.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleErrorFallback {
    /// Fail-open: treat the rule as satisfied and keep evaluating.
    #[default]
    Allow,
    /// Fail-closed: drop the envelope.
    Deny,
}

/// Filter-stage specific settings.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct FilterConfig {
    /// Fallback applied when a compiled rule errors at evaluation time.
    #[serde(default)]
    pub rule_error_fallback: RuleErrorFallback,
}

/// Top-level runtime configuration for a pipeline stage service.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct StageConfig {
    /// Which stage this configuration bootstraps.
    pub service: ServiceKind,
    /// Log level (e.g. `"debug"`, `"info"`, `"warn"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Broker connection and topic settings.
    pub broker: BrokerConfig,
    /// Durable store connection settings.
    #[serde(default)]
    pub stores: StoresConfig,
    /// Retry/backoff policy for the broker consumer.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit breaker tuning applied to external dependencies.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// HTTP health/metrics server settings.
    #[serde(default)]
    pub http: HttpConfig,
    /// Tracing export settings.
    #[serde(default)]
    pub tracing: TracingConfig,
    /// Filter-stage specific settings; ignored by the dedup and enrich
    /// services.
    #[serde(default)]
    pub filter: FilterConfig,
    /// Periodic rule-reload interval, seconds; bounds staleness when control
    /// events are lost.
    #[serde(default = "default_reload_interval_secs")]
    pub reload_interval_secs: u64,
    /// Graceful shutdown timeout, seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_reload_interval_secs() -> u64 {
    30
}
fn default_shutdown_timeout_secs() -> u64 {
    15
}

impl StageConfig {
    /// Construct a minimal filter-stage config with otherwise-default
    /// settings, for tests and local bootstrapping.
    pub fn minimal(service: ServiceKind, broker: BrokerConfig) -> Self {
        Self {
            service,
            log_level: Some("info".into()),
            broker,
            stores: StoresConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            http: HttpConfig::default(),
            tracing: TracingConfig::default(),
            filter: FilterConfig::default(),
            reload_interval_secs: default_reload_interval_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for StoresConfig {
    fn default() -> Self {
        Self {
            filter_rules_db_url: None,
            enrichment_rules_mongo_url: None,
            enrichment_rules_mongo_db: None,
            dedup_redis_url: None,
            enrichment_cache_redis_url: None,
            enrichment_source_postgres_url: None,
            enrichment_source_redis_url: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Recognised log levels.
const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];

/// Interval above which a retry/circuit-breaker setting generates a warning.
const LARGE_INTERVAL_SECS_THRESHOLD: u64 = 3_600;

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a [`StageConfig`] from a TOML file, then apply environment overrides.
pub fn load_config(path: &Path) -> Result<StageConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    let mut config = parse_toml(&content)?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into a [`StageConfig`].
pub fn parse_toml(content: &str) -> Result<StageConfig, ConfigError> {
    toml::from_str::<StageConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Env overrides
// ---------------------------------------------------------------------------

/// Apply environment variable overrides.
///
/// Recognised variables, matching `spec.md` §6 ("broker addresses, store
/// credentials, tracing endpoint, log level"):
/// - `PIPELINE_LOG_LEVEL`
/// - `PIPELINE_BROKER_BOOTSTRAP_SERVERS`
/// - `PIPELINE_DEDUP_REDIS_URL`
/// - `PIPELINE_ENRICHMENT_CACHE_REDIS_URL`
/// - `PIPELINE_FILTER_RULES_DB_URL`
/// - `PIPELINE_ENRICHMENT_RULES_MONGO_URL`
/// - `PIPELINE_TRACING_OTLP_ENDPOINT`
pub fn apply_env_overrides(config: &mut StageConfig) {
    if let Ok(val) = std::env::var("PIPELINE_LOG_LEVEL") {
        config.log_level = Some(val);
    }
    if let Ok(val) = std::env::var("PIPELINE_BROKER_BOOTSTRAP_SERVERS") {
        config.broker.bootstrap_servers = val;
    }
    if let Ok(val) = std::env::var("PIPELINE_DEDUP_REDIS_URL") {
        config.stores.dedup_redis_url = Some(val);
    }
    if let Ok(val) = std::env::var("PIPELINE_ENRICHMENT_CACHE_REDIS_URL") {
        config.stores.enrichment_cache_redis_url = Some(val);
    }
    if let Ok(val) = std::env::var("PIPELINE_FILTER_RULES_DB_URL") {
        config.stores.filter_rules_db_url = Some(val);
    }
    if let Ok(val) = std::env::var("PIPELINE_ENRICHMENT_RULES_MONGO_URL") {
        config.stores.enrichment_rules_mongo_url = Some(val);
    }
    if let Ok(val) = std::env::var("PIPELINE_TRACING_OTLP_ENDPOINT") {
        config.tracing.otlp_endpoint = Some(val);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (empty broker addresses, invalid log level, out-of-range
/// circuit-breaker ratios) are returned as a [`ConfigError::ValidationError`];
/// soft issues come back as warnings.
pub fn validate_config(config: &StageConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if let Some(ref level) = config.log_level
        && !VALID_LOG_LEVELS.contains(&level.as_str())
    {
        errors.push(format!("invalid log_level '{level}'"));
    }

    if config.broker.bootstrap_servers.trim().is_empty() {
        errors.push("broker.bootstrap_servers must not be empty".into());
    }
    if config.broker.topics.input_topic.trim().is_empty() {
        errors.push("broker.topics.input_topic must not be empty".into());
    }
    if config.broker.topics.output_topic.trim().is_empty() {
        errors.push("broker.topics.output_topic must not be empty".into());
    }
    if config.broker.topics.config_update_topic.trim().is_empty() {
        errors.push("broker.topics.config_update_topic must not be empty".into());
    }

    if config.circuit_breaker.failure_ratio_pct > 100 {
        errors.push(format!(
            "circuit_breaker.failure_ratio_pct {} out of range (0..=100)",
            config.circuit_breaker.failure_ratio_pct
        ));
    }
    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".into());
    }

    if config.circuit_breaker.interval_secs > LARGE_INTERVAL_SECS_THRESHOLD {
        warnings.push(ConfigWarning::LargeInterval {
            field: "circuit_breaker.interval_secs".into(),
            secs: config.circuit_breaker.interval_secs,
        });
    }
    if config.reload_interval_secs > LARGE_INTERVAL_SECS_THRESHOLD {
        warnings.push(ConfigWarning::LargeInterval {
            field: "reload_interval_secs".into(),
            secs: config.reload_interval_secs,
        });
    }

    if config.broker.topics.dlq_topic.is_none() {
        warnings.push(ConfigWarning::NoDlqConfigured {
            service: config.service.to_string(),
        });
    }

    match config.service {
        ServiceKind::Filter if config.stores.filter_rules_db_url.is_none() => {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "stores.filter_rules_db_url".into(),
                hint: "filter rule repository will refuse to load a snapshot".into(),
            });
        }
        ServiceKind::Enrich if config.stores.enrichment_rules_mongo_url.is_none() => {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "stores.enrichment_rules_mongo_url".into(),
                hint: "enrichment rule repository will refuse to load a snapshot".into(),
            });
        }
        ServiceKind::Dedup if config.stores.dedup_redis_url.is_none() => {
            warnings.push(ConfigWarning::MissingOptionalField {
                field: "stores.dedup_redis_url".into(),
                hint: "dedup stage cannot reach its TTL store".into(),
            });
        }
        _ => {}
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

// ---------------------------------------------------------------------------
// Merging
// ---------------------------------------------------------------------------

/// Merge two configurations. Values in `overlay` take precedence over `base`.
pub fn merge_configs(base: StageConfig, overlay: StageConfig) -> StageConfig {
    StageConfig {
        service: overlay.service,
        log_level: overlay.log_level.or(base.log_level),
        broker: BrokerConfig {
            bootstrap_servers: overlay.broker.bootstrap_servers,
            consumer_group: overlay.broker.consumer_group,
            topics: TopicsConfig {
                dlq_topic: overlay.broker.topics.dlq_topic.or(base.broker.topics.dlq_topic),
                ..overlay.broker.topics
            },
        },
        stores: StoresConfig {
            filter_rules_db_url: overlay
                .stores
                .filter_rules_db_url
                .or(base.stores.filter_rules_db_url),
            enrichment_rules_mongo_url: overlay
                .stores
                .enrichment_rules_mongo_url
                .or(base.stores.enrichment_rules_mongo_url),
            enrichment_rules_mongo_db: overlay
                .stores
                .enrichment_rules_mongo_db
                .or(base.stores.enrichment_rules_mongo_db),
            dedup_redis_url: overlay.stores.dedup_redis_url.or(base.stores.dedup_redis_url),
            enrichment_cache_redis_url: overlay
                .stores
                .enrichment_cache_redis_url
                .or(base.stores.enrichment_cache_redis_url),
            enrichment_source_postgres_url: overlay
                .stores
                .enrichment_source_postgres_url
                .or(base.stores.enrichment_source_postgres_url),
            enrichment_source_redis_url: overlay
                .stores
                .enrichment_source_redis_url
                .or(base.stores.enrichment_source_redis_url),
        },
        retry: overlay.retry,
        circuit_breaker: overlay.circuit_breaker,
        http: overlay.http,
        tracing: TracingConfig {
            otlp_endpoint: overlay.tracing.otlp_endpoint.or(base.tracing.otlp_endpoint),
        },
        filter: overlay.filter,
        reload_interval_secs: overlay.reload_interval_secs,
        shutdown_timeout_secs: overlay.shutdown_timeout_secs,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_broker() -> BrokerConfig {
        BrokerConfig {
            bootstrap_servers: "localhost:9092".into(),
            consumer_group: "filter-service".into(),
            topics: TopicsConfig {
                input_topic: "raw_events".into(),
                output_topic: "filtered_events".into(),
                config_update_topic: "config_update".into(),
                dlq_topic: None,
            },
        }
    }

    // -- 1. Minimal config is valid with advisory warnings ------------------

    #[test]
    fn minimal_config_is_valid_with_warnings() {
        let cfg = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        let warnings = validate_config(&cfg).expect("minimal config should be valid");
        assert!(!warnings.is_empty());
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::NoDlqConfigured { .. })));
    }

    // -- 2. Default retry/circuit-breaker/http values ------------------------

    #[test]
    fn defaults_are_sensible() {
        let cfg = StageConfig::minimal(ServiceKind::Dedup, sample_broker());
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.circuit_breaker.failure_ratio_pct, 50);
        assert_eq!(cfg.http.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.filter.rule_error_fallback, RuleErrorFallback::Allow);
        assert_eq!(cfg.reload_interval_secs, 30);
    }

    // -- 3. Parse valid TOML --------------------------------------------------

    #[test]
    fn parse_valid_toml_string() {
        let toml = r#"
            service = "enrich"
            log_level = "debug"

            [broker]
            bootstrap_servers = "kafka:9092"
            consumer_group = "enrich-service"

            [broker.topics]
            input_topic = "deduplicated_events"
            output_topic = "processed_events"
            config_update_topic = "config_update"
            dlq_topic = "processed_events.dlq"
        "#;
        let cfg = parse_toml(toml).unwrap();
        assert_eq!(cfg.service, ServiceKind::Enrich);
        assert_eq!(cfg.log_level.as_deref(), Some("debug"));
        assert_eq!(cfg.broker.topics.dlq_topic.as_deref(), Some("processed_events.dlq"));
    }

    // -- 4. Invalid TOML yields ParseError ------------------------------------

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let err = parse_toml("this is [not valid toml =").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    // -- 5. Missing required broker section yields ParseError ----------------

    #[test]
    fn parse_missing_broker_gives_parse_error() {
        let err = parse_toml(r#"service = "filter""#).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    // -- 6. Validation catches invalid log level ------------------------------

    #[test]
    fn validation_catches_invalid_log_level() {
        let mut cfg = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        cfg.log_level = Some("verbose".into());
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    // -- 7. Validation catches empty bootstrap servers ------------------------

    #[test]
    fn validation_catches_empty_bootstrap_servers() {
        let mut broker = sample_broker();
        broker.bootstrap_servers = "  ".into();
        let cfg = StageConfig::minimal(ServiceKind::Filter, broker);
        let err = validate_config(&cfg).unwrap_err();
        match err {
            ConfigError::ValidationError { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("bootstrap_servers")));
            }
            other => panic!("expected ValidationError, got {other:?}"),
        }
    }

    // -- 8. Validation catches out-of-range failure ratio ---------------------

    #[test]
    fn validation_catches_failure_ratio_out_of_range() {
        let mut cfg = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        cfg.circuit_breaker.failure_ratio_pct = 150;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    // -- 9. Validation catches zero max_attempts ------------------------------

    #[test]
    fn validation_catches_zero_max_attempts() {
        let mut cfg = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        cfg.retry.max_attempts = 0;
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    // -- 10. Large interval produces warning, not error -----------------------

    #[test]
    fn large_interval_produces_warning() {
        let mut cfg = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        cfg.reload_interval_secs = 7200;
        cfg.broker.topics.dlq_topic = Some("dlq".into());
        cfg.stores.filter_rules_db_url = Some("postgres://x".into());
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeInterval { .. })));
    }

    // -- 11. Per-service missing store warns -----------------------------------

    #[test]
    fn missing_store_for_service_warns() {
        let cfg = StageConfig::minimal(ServiceKind::Enrich, sample_broker());
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(
            w,
            ConfigWarning::MissingOptionalField { field, .. } if field.contains("mongo")
        )));
    }

    // -- 12. Merge overlay overrides base --------------------------------------

    #[test]
    fn merge_overlay_overrides_base() {
        let base = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        let mut overlay_broker = sample_broker();
        overlay_broker.bootstrap_servers = "kafka-2:9092".into();
        let overlay = StageConfig::minimal(ServiceKind::Filter, overlay_broker);
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.broker.bootstrap_servers, "kafka-2:9092");
    }

    // -- 13. Merge preserves base dlq_topic when overlay lacks one ------------

    #[test]
    fn merge_preserves_base_dlq_topic() {
        let mut base_broker = sample_broker();
        base_broker.topics.dlq_topic = Some("raw_events.dlq".into());
        let base = StageConfig::minimal(ServiceKind::Filter, base_broker);
        let overlay = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.broker.topics.dlq_topic.as_deref(), Some("raw_events.dlq"));
    }

    // -- 14. Roundtrip serialize/deserialize -----------------------------------

    #[test]
    fn toml_roundtrip() {
        let cfg = StageConfig::minimal(ServiceKind::Dedup, sample_broker());
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: StageConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    // -- 15. Load from file on disk --------------------------------------------

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
            service = "dedup"
            log_level = "warn"

            [broker]
            bootstrap_servers = "localhost:9092"
            consumer_group = "dedup-service"

            [broker.topics]
            input_topic = "filtered_events"
            output_topic = "deduplicated_events"
            config_update_topic = "config_update"
            "#
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.service, ServiceKind::Dedup);
        assert_eq!(cfg.log_level.as_deref(), Some("warn"));
    }

    // -- 16. Load missing file gives FileNotFound ------------------------------

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Path::new("/nonexistent/dedup.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    // -- 17. Env override applies on top of a loaded config --------------------

    #[test]
    fn env_override_applies() {
        // SAFETY: test is single-threaded with respect to this env var; no
        // other test in this crate reads or writes PIPELINE_LOG_LEVEL.
        unsafe {
            std::env::set_var("PIPELINE_LOG_LEVEL", "trace");
        }
        let mut cfg = StageConfig::minimal(ServiceKind::Filter, sample_broker());
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.log_level.as_deref(), Some("trace"));
        unsafe {
            std::env::remove_var("PIPELINE_LOG_LEVEL");
        }
    }

    // -- 18. ConfigError Display ------------------------------------------------

    #[test]
    fn config_error_display() {
        let e = ConfigError::FileNotFound { path: "/foo".into() };
        assert!(e.to_string().contains("/foo"));
        let e = ConfigError::ParseError { reason: "bad toml".into() };
        assert!(e.to_string().contains("bad toml"));
        let e = ConfigError::MergeConflict { reason: "oops".into() };
        assert!(e.to_string().contains("oops"));
    }

    // -- 19. ConfigWarning Display ------------------------------------------------

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::NoDlqConfigured { service: "filter".into() };
        assert!(w.to_string().contains("filter"));
        let w = ConfigWarning::LargeInterval { field: "x".into(), secs: 9999 };
        assert!(w.to_string().contains("9999"));
    }

    // -- 20. Service kind display -------------------------------------------------

    #[test]
    fn service_kind_display() {
        assert_eq!(ServiceKind::Filter.to_string(), "filter");
        assert_eq!(ServiceKind::Dedup.to_string(), "dedup");
        assert_eq!(ServiceKind::Enrich.to_string(), "enrich");
    }
}
