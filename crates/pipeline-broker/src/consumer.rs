// SPDX-License-Identifier: MIT OR Apache-2.0
//! The consume-retry-DLQ-commit loop shared by the filter, dedup and
//! enrich services.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use pipeline_error::{ErrorCode, PipelineError};
use pipeline_retry::{retry_with_backoff, BackoffConfig, RetryError};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec;
use crate::dlq::{route_to_dlq, DlqOutcome};
use crate::producer::StageProducer;
use crate::trace::extract_trace_context;
use crate::{HandlerContext, MessageHandler};

/// Static configuration for one [`StageConsumer`] instance.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Broker bootstrap servers.
    pub bootstrap_servers: String,
    /// Consumer group id. All instances of a service share one group so
    /// the broker balances partitions across them.
    pub group_id: String,
    /// Topic this consumer fetches from.
    pub input_topic: String,
    /// Topic the handler's output, if any, is published to.
    pub output_topic: Option<String>,
    /// Dead-letter topic. `None` means retry-exhausted messages are
    /// logged and committed without being republished anywhere.
    pub dlq_topic: Option<String>,
    /// Backoff policy applied to handler failures classified as
    /// retryable.
    pub backoff: BackoffConfig,
}

/// Wraps an `rdkafka` [`StreamConsumer`] with the pipeline's at-least-once
/// processing semantics: fetch, decode, hand off to a [`MessageHandler`]
/// under retry, publish the result (or route to DLQ), and only then
/// commit the offset.
pub struct StageConsumer {
    consumer: StreamConsumer,
    producer: Arc<StageProducer>,
    settings: ConsumerSettings,
}

impl StageConsumer {
    /// Build a consumer subscribed to `settings.input_topic`.
    pub fn new(
        settings: ConsumerSettings,
        producer: Arc<StageProducer>,
    ) -> Result<Self, PipelineError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| {
                PipelineError::new(
                    ErrorCode::BrokerFetchError,
                    format!("failed to build consumer: {e}"),
                )
            })?;
        consumer.subscribe(&[settings.input_topic.as_str()]).map_err(|e| {
            PipelineError::new(
                ErrorCode::BrokerFetchError,
                format!("failed to subscribe to {}: {e}", settings.input_topic),
            )
        })?;
        Ok(Self {
            consumer,
            producer,
            settings,
        })
    }

    /// Run the fetch loop until `cancel` fires.
    ///
    /// Each message goes through: decode (failure is logged and committed
    /// without retry, per `spec.md` §4.8/§7, since a malformed payload has
    /// no well-formed envelope to retry or dead-letter); handler
    /// invocation under [`retry_with_backoff`], isolated from panics via
    /// [`AssertUnwindSafe`] `catch_unwind` so one bad message can't bring
    /// down the consumer task; on success, publish to `output_topic` (if
    /// configured and the handler returned an envelope) and commit; on
    /// retry exhaustion, route to the DLQ (or commit-with-warning if none
    /// is configured).
    pub async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    info!(topic = %self.settings.input_topic, "consumer loop cancelled");
                    return Ok(());
                }
                result = self.consumer.recv() => result,
            };

            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "broker fetch error, continuing");
                    continue;
                }
            };

            let trace_ctx = extract_trace_context(message.headers());
            let ctx = HandlerContext {
                trace_ctx: trace_ctx.clone(),
                source_topic: self.settings.input_topic.clone(),
            };

            let payload = message.payload().unwrap_or_default();
            let envelope = match codec::decode(payload) {
                Ok(env) => env,
                Err(e) => {
                    error!(error = %e, "undecodable message, committing without retry");
                    self.commit(&message);
                    continue;
                }
            };

            let dlq_envelope = envelope.clone();
            let handler = Arc::clone(&handler);
            let outcome = retry_with_backoff(&self.settings.backoff, move || {
                let handler = Arc::clone(&handler);
                let envelope = envelope.clone();
                let ctx = ctx.clone();
                async move {
                    let result = AssertUnwindSafe(handler.handle(envelope, &ctx))
                        .catch_unwind()
                        .await;
                    match result {
                        Ok(inner) => inner,
                        Err(_) => Err(PipelineError::new(
                            ErrorCode::Internal,
                            "handler panicked while processing message",
                        )),
                    }
                }
            })
            .await;

            match outcome {
                Ok(Some(forwarded)) => {
                    if let Some(output_topic) = &self.settings.output_topic {
                        if let Err(e) = self
                            .producer
                            .publish(output_topic, &forwarded, &trace_ctx)
                            .await
                        {
                            error!(error = %e, topic = %output_topic, "failed to publish handler output");
                            continue;
                        }
                    }
                    self.commit(&message);
                }
                Ok(None) => {
                    self.commit(&message);
                }
                Err(RetryError::Exhausted(reason)) => {
                    let dlq_result = route_to_dlq(
                        &self.producer,
                        self.settings.dlq_topic.as_deref(),
                        &self.settings.input_topic,
                        dlq_envelope,
                        &reason,
                        &trace_ctx,
                    )
                    .await;

                    match dlq_result {
                        Ok(DlqOutcome::Routed) => self.commit(&message),
                        Ok(DlqOutcome::NoDlqConfigured) => {
                            warn!(
                                error = %reason,
                                topic = %self.settings.input_topic,
                                "retry exhausted with no DLQ configured, committing"
                            );
                            self.commit(&message);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to publish to DLQ, message will be redelivered");
                        }
                    }
                }
            }
        }
    }

    fn commit(&self, message: &rdkafka::message::BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!(error = %e, "failed to commit offset");
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "pipeline".to_string(),
            input_topic: String::new(),
            output_topic: None,
            dlq_topic: None,
            backoff: BackoffConfig {
                max_attempts: 3,
                initial_interval: Duration::from_millis(100),
                ..Default::default()
            },
        }
    }
}
