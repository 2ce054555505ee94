//! Unified error taxonomy with stable error codes for the event pipeline.
//!
//! Every pipeline error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional cause chain, and
//! arbitrary key-value context. Use the builder returned by
//! [`PipelineError::new`] to construct errors fluently.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family an [`ErrorCode`] belongs to, matching the taxonomy each stage
/// consults to decide how to recover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad expression, unknown source type. Rejected at the control-plane
    /// boundary; never expected to reach the data plane.
    Validation,
    /// Rule id absent, cache miss. Expected control flow, not logged as an
    /// error.
    NotFound,
    /// Store timeout, broker fetch error, network refused. Retried with
    /// backoff and counted against the relevant circuit breaker.
    Transient,
    /// Invalid configuration, non-decodable message. Logged and the message
    /// is committed, or the service aborts.
    Fatal,
    /// Enrichment fetch error under `error_handling: fail`, dedup store error
    /// under `on_redis_error: deny`. Propagated to the consumer, which
    /// applies retry then DLQ.
    Policy,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Policy => "policy",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to a `SCREAMING_SNAKE_CASE` string that does not
/// change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// Envelope failed to parse or is missing a required field.
    EnvelopeInvalid,
    /// An expression failed to compile (syntax or unknown identifier).
    ExprCompileError,
    /// An enrichment rule names a `source_type` the runtime does not support.
    SourceTypeUnknown,

    // -- Not-found --
    /// A rule id referenced by a control event does not exist in the
    /// current snapshot.
    RuleNotFound,
    /// Enrichment cache lookup missed.
    CacheMiss,
    /// A field referenced by a rule is absent from the envelope.
    FieldAbsent,

    // -- Transient --
    /// A durable store (dedup, cache, rule repository) timed out.
    StoreTimeout,
    /// The broker fetch loop failed to read a batch.
    BrokerFetchError,
    /// The broker producer failed to write a message.
    BrokerWriteError,
    /// An upstream dependency refused the connection.
    NetworkRefused,
    /// A circuit breaker is open and short-circuited the call.
    CircuitOpen,

    // -- Fatal --
    /// Configuration file or value is invalid.
    ConfigInvalid,
    /// A broker message could not be decoded as a `MessageEnvelope`.
    MessageNotDecodable,
    /// The per-stage rule repository reported an unrecoverable error.
    RepositoryFatal,

    // -- Policy --
    /// An expression raised a runtime error while evaluating a filter rule.
    ExprRuntimeError,
    /// An enrichment rule's source fetch failed under `error_handling: fail`.
    EnrichmentFetchFailed,
    /// The dedup store failed and `on_redis_error: deny` is configured.
    DedupStoreError,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::EnvelopeInvalid | Self::ExprCompileError | Self::SourceTypeUnknown => {
                ErrorCategory::Validation
            }

            Self::RuleNotFound | Self::CacheMiss | Self::FieldAbsent => ErrorCategory::NotFound,

            Self::StoreTimeout
            | Self::BrokerFetchError
            | Self::BrokerWriteError
            | Self::NetworkRefused
            | Self::CircuitOpen => ErrorCategory::Transient,

            Self::ConfigInvalid | Self::MessageNotDecodable | Self::RepositoryFatal => {
                ErrorCategory::Fatal
            }

            Self::ExprRuntimeError | Self::EnrichmentFetchFailed | Self::DedupStoreError => {
                ErrorCategory::Policy
            }

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Stable `&'static str` representation of the code (e.g.
    /// `"ENVELOPE_INVALID"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnvelopeInvalid => "ENVELOPE_INVALID",
            Self::ExprCompileError => "EXPR_COMPILE_ERROR",
            Self::SourceTypeUnknown => "SOURCE_TYPE_UNKNOWN",
            Self::RuleNotFound => "RULE_NOT_FOUND",
            Self::CacheMiss => "CACHE_MISS",
            Self::FieldAbsent => "FIELD_ABSENT",
            Self::StoreTimeout => "STORE_TIMEOUT",
            Self::BrokerFetchError => "BROKER_FETCH_ERROR",
            Self::BrokerWriteError => "BROKER_WRITE_ERROR",
            Self::NetworkRefused => "NETWORK_REFUSED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::MessageNotDecodable => "MESSAGE_NOT_DECODABLE",
            Self::RepositoryFatal => "REPOSITORY_FATAL",
            Self::ExprRuntimeError => "EXPR_RUNTIME_ERROR",
            Self::EnrichmentFetchFailed => "ENRICHMENT_FETCH_FAILED",
            Self::DedupStoreError => "DEDUP_STORE_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PipelineError
// ---------------------------------------------------------------------------

/// Unified pipeline error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error for cause-chaining, and arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use pipeline_error::{PipelineError, ErrorCode};
///
/// let err = PipelineError::new(ErrorCode::StoreTimeout, "redis GET timed out")
///     .with_context("store", "dedup")
///     .with_context("timeout_ms", 250);
/// ```
pub struct PipelineError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
}

impl PipelineError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Whether this error's category is one the consumer should retry with
    /// backoff before surfacing to DLQ handling.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }
}

impl fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("PipelineError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        d.finish()
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`PipelineError`] (without the opaque source).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Structured context.
    pub context: BTreeMap<String, serde_json::Value>,
    /// String representation of the source error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_message: Option<String>,
}

impl From<&PipelineError> for PipelineErrorDto {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            context: err.context.clone(),
            source_message: err.source.as_ref().map(|s| s.to_string()),
        }
    }
}

impl From<PipelineErrorDto> for PipelineError {
    fn from(dto: PipelineErrorDto) -> Self {
        Self {
            code: dto.code,
            message: dto.message,
            source: None,
            context: dto.context,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::EnvelopeInvalid,
        ErrorCode::ExprCompileError,
        ErrorCode::SourceTypeUnknown,
        ErrorCode::RuleNotFound,
        ErrorCode::CacheMiss,
        ErrorCode::FieldAbsent,
        ErrorCode::StoreTimeout,
        ErrorCode::BrokerFetchError,
        ErrorCode::BrokerWriteError,
        ErrorCode::NetworkRefused,
        ErrorCode::CircuitOpen,
        ErrorCode::ConfigInvalid,
        ErrorCode::MessageNotDecodable,
        ErrorCode::RepositoryFatal,
        ErrorCode::ExprRuntimeError,
        ErrorCode::EnrichmentFetchFailed,
        ErrorCode::DedupStoreError,
        ErrorCode::Internal,
    ];

    #[test]
    fn basic_construction() {
        let err = PipelineError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = PipelineError::new(ErrorCode::RuleNotFound, "no such rule");
        assert_eq!(err.to_string(), "[RULE_NOT_FOUND] no such rule");
    }

    #[test]
    fn display_with_context() {
        let err = PipelineError::new(ErrorCode::StoreTimeout, "timed out")
            .with_context("timeout_ms", 5000);
        let s = err.to_string();
        assert!(s.starts_with("[STORE_TIMEOUT] timed out"));
        assert!(s.contains("timeout_ms"));
        assert!(s.contains("5000"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = PipelineError::new(ErrorCode::ConfigInvalid, "init failed").with_source(src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    #[test]
    fn validation_codes_categorised() {
        assert_eq!(
            ErrorCode::EnvelopeInvalid.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorCode::ExprCompileError.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorCode::SourceTypeUnknown.category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn not_found_codes_categorised() {
        assert_eq!(ErrorCode::RuleNotFound.category(), ErrorCategory::NotFound);
        assert_eq!(ErrorCode::CacheMiss.category(), ErrorCategory::NotFound);
        assert_eq!(ErrorCode::FieldAbsent.category(), ErrorCategory::NotFound);
    }

    #[test]
    fn transient_codes_categorised() {
        assert_eq!(ErrorCode::StoreTimeout.category(), ErrorCategory::Transient);
        assert_eq!(
            ErrorCode::BrokerFetchError.category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ErrorCode::BrokerWriteError.category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            ErrorCode::NetworkRefused.category(),
            ErrorCategory::Transient
        );
        assert_eq!(ErrorCode::CircuitOpen.category(), ErrorCategory::Transient);
    }

    #[test]
    fn fatal_codes_categorised() {
        assert_eq!(ErrorCode::ConfigInvalid.category(), ErrorCategory::Fatal);
        assert_eq!(
            ErrorCode::MessageNotDecodable.category(),
            ErrorCategory::Fatal
        );
        assert_eq!(ErrorCode::RepositoryFatal.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn policy_codes_categorised() {
        assert_eq!(ErrorCode::ExprRuntimeError.category(), ErrorCategory::Policy);
        assert_eq!(
            ErrorCode::EnrichmentFetchFailed.category(),
            ErrorCategory::Policy
        );
        assert_eq!(
            ErrorCode::DedupStoreError.category(),
            ErrorCategory::Policy
        );
    }

    #[test]
    fn is_retryable_only_for_transient() {
        assert!(PipelineError::new(ErrorCode::StoreTimeout, "x").is_retryable());
        assert!(!PipelineError::new(ErrorCode::ConfigInvalid, "x").is_retryable());
        assert!(!PipelineError::new(ErrorCode::RuleNotFound, "x").is_retryable());
    }

    #[test]
    fn builder_chaining_all() {
        let src = io::Error::other("underlying");
        let err = PipelineError::new(ErrorCode::ConfigInvalid, "bad config")
            .with_context("file", "filter.toml")
            .with_source(src);
        assert_eq!(err.code, ErrorCode::ConfigInvalid);
        assert_eq!(err.context["file"], serde_json::json!("filter.toml"));
        assert!(err.source.is_some());
    }

    #[test]
    fn error_code_serde_roundtrip() {
        let code = ErrorCode::EnvelopeInvalid;
        let json = serde_json::to_string(&code).unwrap();
        assert_eq!(json, r#""ENVELOPE_INVALID""#);
        let back: ErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, code);
    }

    #[test]
    fn dto_roundtrip_without_source() {
        let err = PipelineError::new(ErrorCode::FieldAbsent, "missing field")
            .with_context("field", "user_id");
        let dto: PipelineErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        let back: PipelineErrorDto = serde_json::from_str(&json).unwrap();
        assert_eq!(dto, back);
        assert!(back.source_message.is_none());
    }

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = PipelineError::new(ErrorCode::RepositoryFatal, "load failed").with_source(inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn all_codes_display_matches_as_str() {
        for code in ALL_CODES {
            assert_eq!(code.to_string(), code.as_str());
        }
    }

    #[test]
    fn error_category_display() {
        assert_eq!(ErrorCategory::Validation.to_string(), "validation");
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Internal.to_string(), "internal");
    }
}
