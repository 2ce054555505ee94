// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! The `MessageEnvelope` transport record and the rule/config types that
//! drive the filter, dedup, and enrich stages.
//!
//! Nothing here talks to a broker or a store; this crate only defines the
//! shapes those components pass around, plus the small set of invariant
//! helpers (`mark_filtered`, `mark_deduplicated`, `enrichment_entry`) that
//! keep `payload` untouched while stages append to `metadata`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// MessageEnvelope
// ---------------------------------------------------------------------------

/// The universal transport record moving through the pipeline.
///
/// `payload` is never overwritten by any stage; stages only append to
/// `metadata`. See [`EnvelopeMetadata`] for what each stage records there.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MessageEnvelope {
    /// Opaque message identity, used as the partition/routing key.
    pub id: String,
    /// Producer identity.
    pub source: String,
    /// Event time.
    pub timestamp: DateTime<Utc>,
    /// Business body. Unknown shape, treated as an open record.
    pub payload: Map<String, Value>,
    /// Pipeline-maintained annotations. Never touches `payload`.
    #[serde(default)]
    pub metadata: EnvelopeMetadata,
}

impl MessageEnvelope {
    /// Construct a fresh envelope with empty metadata.
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            timestamp,
            payload,
            metadata: EnvelopeMetadata::default(),
        }
    }

    /// Look up a top-level payload field.
    pub fn payload_field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Record that the filter stage passed this envelope, recording which
    /// rules matched (may be empty when the active rule set is empty).
    pub fn mark_filtered(&mut self, rule_ids: Vec<String>, passed_at: DateTime<Utc>) {
        self.metadata.filters_applied = Some(FiltersApplied {
            passed_at,
            rule_ids,
        });
    }

    /// Record the dedup stage's verdict. Per the pipeline's invariant, an
    /// envelope leaving the dedup stage always has `is_unique = true`;
    /// duplicates are dropped rather than forwarded.
    pub fn mark_deduplicated(&mut self, is_unique: bool, checked_at: DateTime<Utc>) {
        self.metadata.deduplication = Some(Deduplication {
            is_unique,
            checked_at,
        });
    }

    /// Mutable access to the `metadata.enrichment` map, initializing it to
    /// an empty mapping on first use.
    pub fn enrichment_entry(&mut self) -> &mut Map<String, Value> {
        self.metadata.enrichment.get_or_insert_with(Map::new)
    }
}

/// Pipeline-maintained annotations attached to an envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct EnvelopeMetadata {
    /// W3C trace id, when trace context propagation is in effect.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub trace_id: Option<String>,
    /// Set by the filter stage when the envelope passes.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filters_applied: Option<FiltersApplied>,
    /// Set by the dedup stage.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deduplication: Option<Deduplication>,
    /// Written to by the enrichment stage, one key per rule's
    /// `target_field`s. Never holds payload data directly.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub enrichment: Option<Map<String, Value>>,
}

/// Recorded by the filter stage on pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FiltersApplied {
    /// When the envelope passed the filter stage.
    pub passed_at: DateTime<Utc>,
    /// Ids of the rules that matched, in evaluation order.
    pub rule_ids: Vec<String>,
}

/// Recorded by the dedup stage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Deduplication {
    /// Whether this envelope was the first occurrence within the TTL window.
    pub is_unique: bool,
    /// When the dedup check ran.
    pub checked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// FilterRule
// ---------------------------------------------------------------------------

/// A single filter stage rule: a boolean expression plus evaluation order.
///
/// Rules are evaluated in descending `priority` order, tie-broken by
/// ascending `created_at`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct FilterRule {
    /// Stable rule identifier.
    pub id: String,
    /// Unique human-readable name.
    pub name: String,
    /// Boolean expression text, compiled by `pipeline-expr`.
    pub expression: String,
    /// Higher values evaluate first.
    pub priority: i64,
    /// Disabled rules are excluded from the loaded snapshot entirely.
    pub enabled: bool,
    /// Creation time, used as the priority tie-breaker.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// EnrichmentRule
// ---------------------------------------------------------------------------

/// Where an enrichment rule fetches its lookup value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// HTTP API lookup.
    Api,
    /// MongoDB document lookup.
    #[serde(alias = "database")]
    Mongodb,
    /// PostgreSQL relational lookup.
    Postgresql,
    /// Redis cache lookup.
    #[serde(alias = "redis")]
    Cache,
}

/// Provider-specific lookup configuration.
///
/// Shaped as an untagged union since each source type only ever populates
/// the fields it needs; a document loaded from the enrichment rule store
/// carries exactly one of these shapes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum SourceConfig {
    /// HTTP request template for `source_type: api`.
    Api {
        /// Request URL, may contain `{field_value}`/`{value}` templates.
        url: String,
        /// HTTP method, e.g. `GET`.
        method: String,
        /// Additional request headers.
        #[serde(default)]
        headers: Map<String, Value>,
        /// Request timeout in milliseconds.
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    /// Query template for `source_type: mongodb` or `postgresql`.
    Query {
        /// Database name, when distinct from the configured connection.
        #[serde(default)]
        database: Option<String>,
        /// Collection or table name.
        collection: String,
        /// Query/filter template; string leaves may contain
        /// `{field_value}` templates. Absent means `{field}={field_value}`.
        #[serde(default)]
        query: Option<Value>,
        /// Field name to filter on when `query` is absent.
        #[serde(default)]
        field: Option<String>,
    },
    /// Key template for `source_type: cache`.
    KeyPattern {
        /// Cache key template, may contain `{field_value}`/`{value}`.
        key_pattern: String,
    },
}

/// How an enrichment rule's fetch/transform errors are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Abort the whole envelope's enrichment.
    Fail,
    /// Abandon this rule's remaining work, continue to the next rule.
    SkipRule,
    /// Abandon this rule's current field, continue with its other fields.
    SkipField,
}

/// A single enrichment rule: a lookup, a cache policy, and transformations.
///
/// Rules are evaluated in ascending `priority` order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EnrichmentRule {
    /// Stable rule identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Name of the payload field whose value is the lookup key.
    pub field_to_enrich: String,
    /// Which provider services this rule's lookups.
    pub source_type: SourceType,
    /// Provider-specific configuration.
    pub source_config: SourceConfig,
    /// Fields to derive from the fetched record, applied in order.
    pub transformations: Vec<Transformation>,
    /// How long a cache hit for this rule remains valid.
    pub cache_ttl_seconds: u64,
    /// What to do when the fetch or a transform expression fails.
    pub error_handling: ErrorHandling,
    /// Value substituted for the fetched record when the fetch fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_value: Option<Value>,
    /// Lower values evaluate first.
    pub priority: i64,
    /// Disabled rules are excluded from the loaded snapshot entirely.
    pub enabled: bool,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// One field derived from an enrichment rule's fetched record.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Transformation {
    /// `.` for the whole fetched record, or a top-level field name within it.
    pub source_path: String,
    /// Name written under `metadata.enrichment`.
    pub target_field: String,
    /// Optional value expression over `payload`, `metadata`, and
    /// `source_data` (the resolved value at `source_path`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Value used when `source_path` resolves to nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

// ---------------------------------------------------------------------------
// DedupConfig
// ---------------------------------------------------------------------------

/// Hash function used to derive the dedup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// MD5.
    Md5,
    /// SHA-256.
    Sha256,
}

/// What to do when the dedup TTL store itself errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Fail-open: treat the envelope as unique.
    Allow,
    /// Fail-closed: surface the error to the caller's retry/DLQ policy.
    Deny,
}

/// Live-reloadable dedup stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DedupConfig {
    /// Hash function applied to the concatenated field values.
    pub hash_algorithm: HashAlgorithm,
    /// TTL of a dedup key, in seconds.
    pub ttl_seconds: u64,
    /// Behavior when the TTL store errors.
    pub on_redis_error: FallbackPolicy,
    /// Ordered, non-empty list of field names hashed to form the dedup key.
    pub fields_to_hash: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            hash_algorithm: HashAlgorithm::Md5,
            ttl_seconds: 300,
            on_redis_error: FallbackPolicy::Allow,
            fields_to_hash: default_fields_to_hash(),
        }
    }
}

/// The default `fields_to_hash` used when configuration omits it.
pub fn default_fields_to_hash() -> Vec<String> {
    vec!["id".to_string(), "source".to_string()]
}

// ---------------------------------------------------------------------------
// ControlEvent
// ---------------------------------------------------------------------------

/// Which rule/config kind a control event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A filter rule was created, changed, or removed.
    FilterRuleUpdated,
    /// An enrichment rule was created, changed, or removed.
    EnrichmentRuleUpdated,
    /// The dedup stage configuration changed.
    DedupConfigUpdated,
}

/// Which stage a control event is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// The filter stage.
    Filter,
    /// The deduplication stage.
    Dedup,
    /// The enrichment stage.
    Enrich,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceType::Filter => "filter",
            ServiceType::Dedup => "dedup",
            ServiceType::Enrich => "enrich",
        };
        write!(f, "{s}")
    }
}

/// What the control plane did to trigger this event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// A rule or config value was created.
    Create,
    /// A rule or config value was updated.
    Update,
    /// A rule was logically deleted.
    Delete,
    /// A rule's `enabled` flag was flipped.
    Toggle,
    /// An unconditional reload was requested, independent of any single change.
    Reload,
}

/// A control-plane message instructing a stage to reload rules or mutate
/// its live configuration.
///
/// Published on the config-update topic as the `payload` of a
/// [`MessageEnvelope`], with `event_type` and `service_type` duplicated into
/// `metadata.enrichment` for cheap filtering without a full decode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ControlEvent {
    /// What kind of rule/config this event concerns.
    pub event_type: EventType,
    /// Which stage this event is addressed to.
    pub service_type: ServiceType,
    /// What happened.
    pub action: Action,
    /// The affected rule's id, when applicable (absent for bulk `reload`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// Who or what made the change, for audit purposes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changed_by: Option<String>,
    /// Free-form additional context.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_envelope() -> MessageEnvelope {
        let mut payload = Map::new();
        payload.insert("status".to_string(), json!("active"));
        MessageEnvelope::new("m1", "svc-a", Utc::now(), payload)
    }

    #[test]
    fn new_envelope_has_empty_metadata() {
        let env = sample_envelope();
        assert!(env.metadata.trace_id.is_none());
        assert!(env.metadata.filters_applied.is_none());
        assert!(env.metadata.deduplication.is_none());
        assert!(env.metadata.enrichment.is_none());
    }

    #[test]
    fn mark_filtered_sets_applied_rules() {
        let mut env = sample_envelope();
        let now = Utc::now();
        env.mark_filtered(vec!["rule-1".to_string()], now);
        let applied = env.metadata.filters_applied.unwrap();
        assert_eq!(applied.rule_ids, vec!["rule-1"]);
        assert_eq!(applied.passed_at, now);
    }

    #[test]
    fn mark_deduplicated_records_verdict() {
        let mut env = sample_envelope();
        let now = Utc::now();
        env.mark_deduplicated(true, now);
        let dedup = env.metadata.deduplication.unwrap();
        assert!(dedup.is_unique);
    }

    #[test]
    fn enrichment_entry_initializes_once() {
        let mut env = sample_envelope();
        env.enrichment_entry()
            .insert("user_name".to_string(), json!("John"));
        env.enrichment_entry()
            .insert("user_email".to_string(), json!("j@x"));
        let enrichment = env.metadata.enrichment.unwrap();
        assert_eq!(enrichment.len(), 2);
        assert_eq!(enrichment["user_name"], json!("John"));
    }

    #[test]
    fn payload_is_never_touched_by_metadata_helpers() {
        let mut env = sample_envelope();
        let original_payload = env.payload.clone();
        env.mark_filtered(vec![], Utc::now());
        env.mark_deduplicated(true, Utc::now());
        env.enrichment_entry().insert("x".to_string(), json!(1));
        assert_eq!(env.payload, original_payload);
    }

    #[test]
    fn envelope_serde_roundtrip() {
        let env = sample_envelope();
        let json = serde_json::to_string(&env).unwrap();
        let env2: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env2.id, env.id);
        assert_eq!(env2.payload, env.payload);
    }

    #[test]
    fn dedup_config_default_fields() {
        let cfg = DedupConfig::default();
        assert_eq!(cfg.fields_to_hash, vec!["id", "source"]);
        assert_eq!(cfg.hash_algorithm, HashAlgorithm::Md5);
        assert_eq!(cfg.on_redis_error, FallbackPolicy::Allow);
    }

    #[test]
    fn source_type_accepts_legacy_aliases() {
        let mongo: SourceType = serde_json::from_str("\"database\"").unwrap();
        assert_eq!(mongo, SourceType::Mongodb);
        let cache: SourceType = serde_json::from_str("\"redis\"").unwrap();
        assert_eq!(cache, SourceType::Cache);
    }

    #[test]
    fn source_config_untagged_api_shape() {
        let raw = json!({
            "url": "https://example.com/{field_value}",
            "method": "GET",
        });
        let cfg: SourceConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(cfg, SourceConfig::Api { .. }));
    }

    #[test]
    fn source_config_untagged_key_pattern_shape() {
        let raw = json!({ "key_pattern": "user:{value}" });
        let cfg: SourceConfig = serde_json::from_value(raw).unwrap();
        assert!(matches!(cfg, SourceConfig::KeyPattern { .. }));
    }

    #[test]
    fn control_event_serde_roundtrip() {
        let event = ControlEvent {
            event_type: EventType::FilterRuleUpdated,
            service_type: ServiceType::Filter,
            action: Action::Update,
            rule_id: Some("rule-1".to_string()),
            timestamp: Utc::now(),
            changed_by: Some("operator".to_string()),
            metadata: Map::new(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let event2: ControlEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event2.event_type, event.event_type);
        assert_eq!(event2.service_type, event.service_type);
    }

    #[test]
    fn service_type_display() {
        assert_eq!(ServiceType::Filter.to_string(), "filter");
        assert_eq!(ServiceType::Dedup.to_string(), "dedup");
        assert_eq!(ServiceType::Enrich.to_string(), "enrich");
    }

    #[test]
    fn filter_rule_serde_roundtrip() {
        let rule = FilterRule {
            id: "r1".to_string(),
            name: "active-only".to_string(),
            expression: "payload.status == 'active'".to_string(),
            priority: 10,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&rule).unwrap();
        let rule2: FilterRule = serde_json::from_str(&json).unwrap();
        assert_eq!(rule2.name, rule.name);
        assert_eq!(rule2.priority, rule.priority);
    }
}
