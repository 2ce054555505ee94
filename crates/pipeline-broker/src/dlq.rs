// SPDX-License-Identifier: MIT OR Apache-2.0
//! Routing of retry-exhausted envelopes to a dead-letter topic.

use chrono::Utc;
use pipeline_envelope::MessageEnvelope;
use pipeline_error::PipelineError;
use serde_json::json;

use crate::producer::StageProducer;
use crate::trace::TraceContext;

/// Stamp `envelope.metadata.enrichment` with the dead-letter fields spec'd
/// for DLQ routing (`dlq_reason`, `dlq_source_topic`, `dlq_timestamp`) and
/// return the mutated envelope, ready to publish to the DLQ topic.
pub fn annotate_for_dlq(
    mut envelope: MessageEnvelope,
    reason: &PipelineError,
    source_topic: &str,
) -> MessageEnvelope {
    let entry = envelope.enrichment_entry();
    entry.insert("dlq_reason".to_string(), json!(reason.to_string()));
    entry.insert("dlq_source_topic".to_string(), json!(source_topic));
    entry.insert("dlq_timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    envelope
}

/// Outcome of attempting to route an envelope to the dead letter queue.
#[derive(Debug)]
pub enum DlqOutcome {
    /// Published to `dlq_topic`.
    Routed,
    /// No DLQ topic was configured for this service; the caller should log
    /// a warning and still commit the offset, since there is nowhere left
    /// to send the message and at-least-once delivery has no retry budget
    /// remaining.
    NoDlqConfigured,
}

/// Route a retry-exhausted envelope to `dlq_topic`, if one is configured.
pub async fn route_to_dlq(
    producer: &StageProducer,
    dlq_topic: Option<&str>,
    source_topic: &str,
    envelope: MessageEnvelope,
    reason: &PipelineError,
    trace_ctx: &TraceContext,
) -> Result<DlqOutcome, PipelineError> {
    let Some(dlq_topic) = dlq_topic else {
        return Ok(DlqOutcome::NoDlqConfigured);
    };
    let annotated = annotate_for_dlq(envelope, reason, source_topic);
    producer.publish(dlq_topic, &annotated, trace_ctx).await?;
    Ok(DlqOutcome::Routed)
}
