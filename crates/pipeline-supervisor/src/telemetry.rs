// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process-scope logging and distributed-tracing setup.
//!
//! Per `spec.md` §9 ("Global state"), the metrics registry and the tracer
//! provider have process lifetimes: both are built once in a service's
//! `serve` entry point and torn down in reverse order on exit. This module
//! owns the tracer provider; [`pipeline_telemetry::PipelineMetrics`] owns the
//! registry.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Holds the process-lifetime tracer provider so it can be shut down
/// explicitly when the service exits; dropping it without calling
/// [`TracingGuard::shutdown`] would leak any batched-but-unexported spans.
pub struct TracingGuard {
    provider: Option<SdkTracerProvider>,
}

impl TracingGuard {
    /// Flush and shut down the tracer provider, if one was built (a
    /// service with no `tracing.otlp_endpoint` configured runs with local
    /// `tracing-subscriber` output only and has nothing to shut down).
    pub fn shutdown(mut self) {
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to shut down tracer provider cleanly: {e}");
            }
        }
    }
}

/// Initialise the global `tracing` subscriber for `service_name`.
///
/// `log_level` drives an [`EnvFilter`] directive (`"info"`, `"debug"`, ...);
/// `otlp_endpoint`, when present, additionally exports spans via OTLP over
/// the `opentelemetry-otlp` exporter, layered on top of the `tracing-subscriber`
/// + `tracing-opentelemetry` setup. Returns a guard that must be held for the
/// process lifetime and explicitly shut down.
pub fn init_tracing(
    service_name: &str,
    log_level: Option<&str>,
    otlp_endpoint: Option<&str>,
) -> Result<TracingGuard, anyhow::Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.unwrap_or("info")));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    match otlp_endpoint {
        Some(endpoint) => {
            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_tonic()
                .with_endpoint(endpoint)
                .build()?;

            let provider = SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(
                    Resource::builder()
                        .with_service_name(service_name.to_string())
                        .build(),
                )
                .build();

            let tracer = provider.tracer(service_name.to_string());
            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

            build_registry(filter, fmt_layer, Some(otel_layer)).init();

            Ok(TracingGuard {
                provider: Some(provider),
            })
        }
        None => {
            build_registry(filter, fmt_layer, None).init();
            Ok(TracingGuard { provider: None })
        }
    }
}

fn build_registry<F, O>(
    filter: EnvFilter,
    fmt_layer: F,
    otel_layer: Option<O>,
) -> impl Subscriber + Send + Sync
where
    F: tracing_subscriber::Layer<Registry> + Send + Sync,
    O: tracing_subscriber::Layer<Registry> + Send + Sync,
{
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
}
