// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Dedup stage service binary: consumes filtered events, drops envelopes
//! already seen within the configured TTL window, and forwards the rest
//! downstream.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pipeline_broker::{ConsumerSettings, StageConsumer, StageProducer};
use pipeline_config::{load_config, validate_config, StageConfig};
use pipeline_control::{ControlConsumer, ControlConsumerSettings};
use pipeline_dedup::{DedupStage, DedupStore, RedisDedupStore};
use pipeline_envelope::DedupConfig;
use pipeline_repository::InMemoryDedupConfigStore;
use pipeline_retry::BackoffConfig;
use pipeline_supervisor::{spawn_http_server, spawn_signal_shutdown, AppState, HealthChecker, Supervisor};
use pipeline_telemetry::PipelineMetrics;
use tokio_util::sync::CancellationToken;
use tracing::info;

const EXIT_FAILURE: i32 = 1;

/// How often the background key-count sampler updates
/// `pipeline_stage_latency_seconds{stage="key_count_sample"}`.
const KEY_COUNT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "dedup-service", version, about = "Event pipeline dedup stage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the stage until a shutdown signal is received.
    Serve {
        /// Path to the stage's TOML configuration file.
        #[arg(long, env = "CONFIG_FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Command::Serve { config } = cli.command;

    if let Err(e) = serve(config).await {
        eprintln!("dedup-service: {e:#}");
        std::process::exit(EXIT_FAILURE);
    }
}

async fn serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    for warning in validate_config(&config).context("validating config")? {
        eprintln!("warning: {warning}");
    }

    let _tracing_guard = pipeline_supervisor::init_tracing(
        "dedup-service",
        config.log_level.as_deref(),
        config.tracing.otlp_endpoint.as_deref(),
    )
    .context("initialising tracing")?;

    info!(service = %config.service, "dedup-service starting");

    let redis_url = config
        .stores
        .dedup_redis_url
        .as_deref()
        .context("config.stores.dedup_redis_url is required for the dedup stage")?;
    let store: Arc<dyn DedupStore> =
        Arc::new(RedisDedupStore::connect(redis_url).await.context("connecting to dedup redis")?);

    let metrics = Arc::new(PipelineMetrics::new("dedup").context("building metrics registry")?);
    let config_store = Arc::new(InMemoryDedupConfigStore::new(DedupConfig::default()));
    let stage = Arc::new(DedupStage::new(Arc::clone(&store), Arc::clone(&config_store), Arc::clone(&metrics)));

    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(cancel.clone(), Duration::from_secs(config.shutdown_timeout_secs));

    let producer = Arc::new(
        StageProducer::new(&config.broker.bootstrap_servers).context("building broker producer")?,
    );

    let consumer_settings = ConsumerSettings {
        bootstrap_servers: config.broker.bootstrap_servers.clone(),
        group_id: config.broker.consumer_group.clone(),
        input_topic: config.broker.topics.input_topic.clone(),
        output_topic: Some(config.broker.topics.output_topic.clone()),
        dlq_topic: config.broker.topics.dlq_topic.clone(),
        backoff: backoff_from_config(&config),
    };
    let consumer = StageConsumer::new(consumer_settings, Arc::clone(&producer))
        .context("building data-topic consumer")?;
    let consumer_cancel = supervisor.cancellation_token();
    let handler = Arc::clone(&stage) as Arc<dyn pipeline_broker::MessageHandler>;
    supervisor.spawn("data-consumer", async move { consumer.run(handler, consumer_cancel).await });

    let control_settings = ControlConsumerSettings {
        bootstrap_servers: config.broker.bootstrap_servers.clone(),
        group_id: format!("{}-control", config.broker.consumer_group),
        control_topic: config.broker.topics.config_update_topic.clone(),
        reload_interval: Duration::from_secs(config.reload_interval_secs),
    };
    let control_consumer =
        ControlConsumer::new(control_settings).context("building control-topic consumer")?;
    let control_cancel = supervisor.cancellation_token();
    let reload_handler = Arc::clone(&stage) as Arc<dyn pipeline_control::ReloadHandler>;
    supervisor.spawn_fire_and_forget("control-consumer", async move {
        control_consumer.run(reload_handler, control_cancel).await
    });

    let sampler_cancel = supervisor.cancellation_token();
    let sampler_handle = stage.spawn_key_count_sampler(KEY_COUNT_SAMPLE_INTERVAL, sampler_cancel);
    supervisor.spawn_fire_and_forget("key-count-sampler", async move {
        let _ = sampler_handle.await;
    });

    let checkers: Vec<Arc<dyn HealthChecker>> = vec![Arc::new(DedupStoreHealthChecker { store })];
    let app_state = Arc::new(AppState {
        checkers,
        metrics: Arc::clone(&metrics),
    });
    spawn_http_server(&mut supervisor, config.http.bind_addr.clone(), app_state);

    spawn_signal_shutdown(cancel);

    supervisor.join().await.context("running supervised tasks")?;

    info!("dedup-service shut down cleanly");
    Ok(())
}

fn backoff_from_config(config: &StageConfig) -> BackoffConfig {
    BackoffConfig {
        initial_interval: Duration::from_millis(config.retry.initial_interval_ms),
        multiplier: config.retry.multiplier_permille as f64 / 1000.0,
        max_interval: Duration::from_millis(config.retry.max_interval_ms),
        max_attempts: config.retry.max_attempts,
        max_elapsed_time: config.retry.max_elapsed_time_ms.map(Duration::from_millis),
    }
}

struct DedupStoreHealthChecker {
    store: Arc<dyn DedupStore>,
}

#[async_trait::async_trait]
impl HealthChecker for DedupStoreHealthChecker {
    fn name(&self) -> &str {
        "redis-dedup"
    }

    async fn check(&self) -> Result<(), String> {
        self.store.approximate_key_count().await.map(|_| ()).map_err(|e| e.to_string())
    }
}
