// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `/health` and `/metrics` HTTP surface shared by every stage binary.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use pipeline_telemetry::PipelineMetrics;
use serde_json::json;

use crate::health::HealthChecker;

/// Shared state for the health/metrics router.
pub struct AppState {
    /// One checker per external dependency this service depends on.
    pub checkers: Vec<Arc<dyn HealthChecker>>,
    /// This service's metrics registry.
    pub metrics: Arc<PipelineMetrics>,
}

/// Build the router mounting `/health` and `/metrics`.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = Vec::with_capacity(state.checkers.len());
    let mut all_healthy = true;
    for checker in &state.checkers {
        let result = checker.check().await;
        if result.is_err() {
            all_healthy = false;
        }
        checks.push(json!({
            "name": checker.name(),
            "status": if result.is_ok() { "healthy" } else { "unhealthy" },
            "reason": result.err(),
        }));
    }

    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if all_healthy { "ok" } else { "degraded" },
            "checks": checks,
        })),
    )
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            format!("failed to encode metrics: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::StaticChecker;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state(checkers: Vec<Arc<dyn HealthChecker>>) -> Arc<AppState> {
        Arc::new(AppState {
            checkers,
            metrics: Arc::new(PipelineMetrics::new("supervisor-test").unwrap()),
        })
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_is_ok_when_every_checker_passes() {
        let app = build_app(state(vec![Arc::new(StaticChecker {
            name: "redis".to_string(),
            healthy: true,
        })]));
        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn health_is_degraded_when_any_checker_fails() {
        let app = build_app(state(vec![
            Arc::new(StaticChecker {
                name: "redis".to_string(),
                healthy: true,
            }),
            Arc::new(StaticChecker {
                name: "postgres".to_string(),
                healthy: false,
            }),
        ]));
        let (status, body) = get(app, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "degraded");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_text() {
        let app = build_app(state(vec![]));
        let (status, body) = get(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("pipeline_messages_total"));
    }
}
