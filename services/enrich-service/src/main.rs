// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Enrichment stage service binary: consumes deduplicated events, attaches
//! derived fields looked up from per-rule external sources, and forwards
//! the result downstream.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pipeline_broker::{ConsumerSettings, StageConsumer, StageProducer};
use pipeline_config::{load_config, validate_config, StageConfig};
use pipeline_control::{ControlConsumer, ControlConsumerSettings};
use pipeline_enrich::{
    ApiProvider, CacheSourceProvider, EnrichmentCache, EnrichmentProvider, EnrichmentStage,
    MongoProvider, PostgresProvider, RedisEnrichmentCache,
};
use pipeline_envelope::SourceType;
use pipeline_repository::MongoEnrichmentRuleRepository;
use pipeline_retry::{BackoffConfig, CircuitBreakerRegistry};
use pipeline_supervisor::{spawn_http_server, spawn_signal_shutdown, AppState, HealthChecker, Supervisor};
use pipeline_telemetry::PipelineMetrics;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EXIT_FAILURE: i32 = 1;

#[derive(Parser, Debug)]
#[command(name = "enrich-service", version, about = "Event pipeline enrichment stage")]
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
        eprintln!("enrich-service: {e:#}");
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
        "enrich-service",
        config.log_level.as_deref(),
        config.tracing.otlp_endpoint.as_deref(),
    )
    .context("initialising tracing")?;

    info!(service = %config.service, "enrich-service starting");

    let mongo_url = config
        .stores
        .enrichment_rules_mongo_url
        .as_deref()
        .context("config.stores.enrichment_rules_mongo_url is required for the enrich stage")?;
    let mongo_db_name = config
        .stores
        .enrichment_rules_mongo_db
        .as_deref()
        .context("config.stores.enrichment_rules_mongo_db is required for the enrich stage")?;
    let mongo_client = mongodb::Client::with_uri_str(mongo_url)
        .await
        .context("connecting to enrichment rules mongodb")?;
    let mongo_db = mongo_client.database(mongo_db_name);

    let cache_url = config
        .stores
        .enrichment_cache_redis_url
        .as_deref()
        .context("config.stores.enrichment_cache_redis_url is required for the enrich stage")?;
    let cache: Arc<dyn EnrichmentCache> = Arc::new(
        RedisEnrichmentCache::connect(cache_url)
            .await
            .context("connecting to enrichment cache redis")?,
    );

    let metrics = Arc::new(PipelineMetrics::new("enrich").context("building metrics registry")?);
    let breakers = Arc::new(CircuitBreakerRegistry::new(circuit_breaker_config_from(&config)));
    let providers = build_providers(&config, &mongo_db).await.context("building enrichment providers")?;

    let repository = Arc::new(MongoEnrichmentRuleRepository::new(
        mongo_db.collection("enrichment_rules"),
    ));
    let stage = Arc::new(EnrichmentStage::new(
        repository,
        cache,
        providers,
        Arc::clone(&breakers),
        Arc::clone(&metrics),
    ));
    stage.reload().await.context("loading initial enrichment rule set")?;

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

    let checkers: Vec<Arc<dyn HealthChecker>> =
        vec![Arc::new(MongoHealthChecker { database: mongo_db }), Arc::new(CircuitBreakerHealthChecker { breakers })];
    let app_state = Arc::new(AppState {
        checkers,
        metrics: Arc::clone(&metrics),
    });
    spawn_http_server(&mut supervisor, config.http.bind_addr.clone(), app_state);

    spawn_signal_shutdown(cancel);

    supervisor.join().await.context("running supervised tasks")?;

    info!("enrich-service shut down cleanly");
    Ok(())
}

/// Build the provider dispatch table. A source type whose connection
/// details are absent from configuration is simply left out of the map;
/// [`EnrichmentStage::enrich`] treats a rule referencing it as a
/// per-rule `SOURCE_TYPE_UNKNOWN` failure rather than a startup error,
/// since not every deployment wires up every source kind.
async fn build_providers(
    config: &StageConfig,
    mongo_db: &mongodb::Database,
) -> anyhow::Result<HashMap<SourceType, Arc<dyn EnrichmentProvider>>> {
    let mut providers: HashMap<SourceType, Arc<dyn EnrichmentProvider>> = HashMap::new();

    providers.insert(SourceType::Api, Arc::new(ApiProvider::new(reqwest::Client::new())));
    providers.insert(SourceType::Mongodb, Arc::new(MongoProvider::new(mongo_db.clone())));

    if let Some(pg_url) = config.stores.enrichment_source_postgres_url.as_deref() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(pg_url)
            .await
            .context("connecting to enrichment source postgresql")?;
        providers.insert(SourceType::Postgresql, Arc::new(PostgresProvider::new(pool)));
    } else {
        warn!("no enrichment_source_postgres_url configured; postgresql-sourced rules will fail at fetch time");
    }

    let cache_source_url = config
        .stores
        .enrichment_source_redis_url
        .as_deref()
        .or(config.stores.enrichment_cache_redis_url.as_deref());
    if let Some(redis_url) = cache_source_url {
        let client = redis::Client::open(redis_url).context("invalid enrichment source redis url")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("connecting to enrichment source redis")?;
        providers.insert(SourceType::Cache, Arc::new(CacheSourceProvider::new(conn)));
    } else {
        warn!("no enrichment_source_redis_url configured; cache-sourced rules will fail at fetch time");
    }

    Ok(providers)
}

fn circuit_breaker_config_from(config: &StageConfig) -> pipeline_retry::CircuitBreakerConfig {
    pipeline_retry::CircuitBreakerConfig {
        min_requests: config.circuit_breaker.min_requests,
        failure_ratio_pct: config.circuit_breaker.failure_ratio_pct,
        interval: Duration::from_secs(config.circuit_breaker.interval_secs),
        open_timeout: Duration::from_secs(config.circuit_breaker.open_timeout_secs),
        half_open_max_requests: config.circuit_breaker.half_open_max_requests,
    }
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

struct MongoHealthChecker {
    database: mongodb::Database,
}

#[async_trait::async_trait]
impl HealthChecker for MongoHealthChecker {
    fn name(&self) -> &str {
        "mongodb-enrichment-rules"
    }

    async fn check(&self) -> Result<(), String> {
        self.database
            .run_command(mongodb::bson::doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

struct CircuitBreakerHealthChecker {
    breakers: Arc<CircuitBreakerRegistry>,
}

#[async_trait::async_trait]
impl HealthChecker for CircuitBreakerHealthChecker {
    fn name(&self) -> &str {
        "enrichment-circuit-breakers"
    }

    async fn check(&self) -> Result<(), String> {
        let open: Vec<String> = self
            .breakers
            .snapshot()
            .into_iter()
            .filter(|(_, state)| *state == pipeline_retry::State::Open)
            .map(|(name, _)| name)
            .collect();
        if open.is_empty() {
            Ok(())
        } else {
            Err(format!("open circuit breakers: {}", open.join(", ")))
        }
    }
}
