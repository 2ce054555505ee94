// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline_envelope::{ControlEvent, ServiceType};
use pipeline_error::PipelineError;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A stage's response to control events: either re-read a durable rule
/// store (filter, enrichment) or apply a value carried directly in the
/// event's `metadata` (dedup config, which has no durable store of its
/// own per `spec.md` §4.5). The two paths are kept separate because a
/// filter/enrichment reload ignores the event's contents entirely, while
/// a dedup config update's new value only exists in the event.
#[async_trait]
pub trait ReloadHandler: Send + Sync {
    /// Which stage this handler belongs to; events addressed to other
    /// stages are acknowledged and ignored.
    fn service_type(&self) -> ServiceType;

    /// Apply a matching control event: re-read the repository, or parse
    /// and install the config carried in `event.metadata`. A failure here
    /// is logged by the caller; the previously installed snapshot remains
    /// in effect.
    async fn on_control_event(&self, event: &ControlEvent) -> Result<(), PipelineError>;

    /// Run the periodic safety net independent of any observed event,
    /// bounding staleness when control events are lost in transit.
    /// Stages with no external source to re-poll (dedup config, which
    /// only ever changes via an event) can make this a no-op.
    async fn on_periodic_tick(&self) -> Result<(), PipelineError>;
}

/// Settings for a [`ControlConsumer`].
#[derive(Debug, Clone)]
pub struct ControlConsumerSettings {
    /// Broker bootstrap servers.
    pub bootstrap_servers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Config-update topic.
    pub control_topic: String,
    /// How often to run the periodic reload safety net, independent of
    /// observed control events.
    pub reload_interval: Duration,
}

/// Subscribes to the control topic and drives a [`ReloadHandler`].
pub struct ControlConsumer {
    consumer: StreamConsumer,
    settings: ControlConsumerSettings,
}

impl ControlConsumer {
    /// Build a consumer subscribed to `settings.control_topic`.
    pub fn new(settings: ControlConsumerSettings) -> Result<Self, PipelineError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &settings.bootstrap_servers)
            .set("group.id", &settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| {
                PipelineError::new(
                    pipeline_error::ErrorCode::BrokerFetchError,
                    format!("failed to build control consumer: {e}"),
                )
            })?;
        consumer
            .subscribe(&[settings.control_topic.as_str()])
            .map_err(|e| {
                PipelineError::new(
                    pipeline_error::ErrorCode::BrokerFetchError,
                    format!("failed to subscribe to {}: {e}", settings.control_topic),
                )
            })?;
        Ok(Self { consumer, settings })
    }

    /// Run the event-driven reload loop and the periodic safety net
    /// together until `cancel` fires.
    pub async fn run(&self, handler: Arc<dyn ReloadHandler>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.reload_interval);
        ticker.tick().await; // first tick fires immediately; consume it

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(topic = %self.settings.control_topic, "control consumer cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = handler.on_periodic_tick().await {
                        warn!(error = %e, "periodic reload failed, previous snapshot remains active");
                    }
                }
                message = self.consumer.recv() => {
                    self.handle_message(message, &handler).await;
                }
            }
        }
    }

    async fn handle_message(
        &self,
        message: Result<rdkafka::message::BorrowedMessage<'_>, rdkafka::error::KafkaError>,
        handler: &Arc<dyn ReloadHandler>,
    ) {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "control topic fetch error, continuing");
                return;
            }
        };

        let payload = message.payload().unwrap_or_default();
        let event: ControlEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "unparseable control event, acknowledging without reload");
                self.commit(&message);
                return;
            }
        };

        if event.service_type != handler.service_type() {
            self.commit(&message);
            return;
        }

        if let Err(e) = handler.on_control_event(&event).await {
            warn!(
                error = %e,
                event_type = ?event.event_type,
                rule_id = ?event.rule_id,
                "reload triggered by control event failed, previous snapshot remains active"
            );
        }
        self.commit(&message);
    }

    fn commit(&self, message: &rdkafka::message::BorrowedMessage<'_>) {
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!(error = %e, "failed to commit control event offset");
        }
    }
}
