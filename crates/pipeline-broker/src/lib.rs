// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! Stage crates depend on [`MessageHandler`] and [`StageConsumer`]/
//! [`StageProducer`] rather than on `rdkafka` directly, so filter, dedup
//! and enrich only ever see a decoded [`MessageEnvelope`] and a
//! [`HandlerContext`].

mod codec;
mod consumer;
mod dlq;
mod producer;
mod trace;

pub use codec::{decode, encode};
pub use consumer::{ConsumerSettings, StageConsumer};
pub use dlq::{annotate_for_dlq, route_to_dlq, DlqOutcome};
pub use producer::StageProducer;
pub use trace::{extract_trace_context, inject_trace_context, TraceContext};

use async_trait::async_trait;
use pipeline_envelope::MessageEnvelope;
use pipeline_error::PipelineError;

/// Per-message context handed to a [`MessageHandler`] alongside the
/// decoded envelope: the trace context extracted from broker headers and
/// the topic the message was fetched from.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Trace context extracted from the consumed message's headers.
    pub trace_ctx: TraceContext,
    /// Topic the message was fetched from.
    pub source_topic: String,
}

/// A stage's message-processing logic: filter, dedup or enrich, applied
/// to one decoded envelope at a time.
///
/// Implementations return a [`PipelineError`] to signal failure; whether
/// the consumer retries depends on [`PipelineError::is_retryable`]. A
/// successful call returns the envelope to forward downstream, or `None`
/// if the stage decides the message should be dropped without forwarding
/// (the filter stage's deny path).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one envelope, returning the envelope to forward (if any).
    async fn handle(
        &self,
        envelope: MessageEnvelope,
        ctx: &HandlerContext,
    ) -> Result<Option<MessageEnvelope>, PipelineError>;
}
