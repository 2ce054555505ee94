// SPDX-License-Identifier: MIT OR Apache-2.0
//! Envelope publishing over a shared `rdkafka` producer handle.

use std::time::Duration;

use pipeline_envelope::MessageEnvelope;
use pipeline_error::{ErrorCode, PipelineError};
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;

use crate::codec;
use crate::trace::{inject_trace_context, TraceContext};

/// How long a single publish call waits for broker acknowledgement before
/// treating the send as failed.
const DEFAULT_PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes encoded envelopes to broker topics, one shared handle per
/// service process.
pub struct StageProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl StageProducer {
    /// Build a producer against `bootstrap_servers`.
    pub fn new(bootstrap_servers: &str) -> Result<Self, PipelineError> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .create()
            .map_err(|e| {
                PipelineError::new(
                    ErrorCode::BrokerWriteError,
                    format!("failed to build producer: {e}"),
                )
            })?;
        Ok(Self {
            producer,
            timeout: DEFAULT_PRODUCE_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Encode `envelope` and publish it to `topic`, carrying `trace_ctx`
    /// through W3C headers. Keyed on `envelope.id` so retries and
    /// re-publishes of the same message land on the same partition.
    pub async fn publish(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
        trace_ctx: &TraceContext,
    ) -> Result<(), PipelineError> {
        let payload = codec::encode(envelope)?;
        let headers = inject_trace_context(trace_ctx, OwnedHeaders::new());
        let record = FutureRecord::to(topic)
            .key(&envelope.id)
            .payload(&payload)
            .headers(headers);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| {
                PipelineError::new(
                    ErrorCode::BrokerWriteError,
                    format!("publish to {topic} failed: {e}"),
                )
                .with_context("topic", topic)
            })?;
        Ok(())
    }
}
