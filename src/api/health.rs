/// Health check and metrics endpoints
///
/// Liveness answers as long as the process can respond; readiness also
/// requires the site store to be reachable.
use crate::{context::AppContext, jobs, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// "ready" or "unavailable"
    pub status: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_basic))
        .route("/health/ready", get(readiness_check))
        .route("/metrics", get(metrics_endpoint))
}

/// Basic health check
pub async fn health_basic() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness check - 503 while the database is unreachable
pub async fn readiness_check(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let start = Instant::now();

    match jobs::tasks::health_check(&ctx).await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "ready".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                database_ms: Some(start.elapsed().as_millis() as u64),
                error: None,
            }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "readiness_check_failed: database check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "unavailable".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    database_ms: None,
                    error: Some(e.to_string()),
                }),
            )
        }
    }
}

/// Prometheus scrape endpoint
pub async fn metrics_endpoint() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}
