use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use tracing::info;

use crate::server::dtos::status_dto::{MemoryStats, StatusResponse};
use crate::server::services::app_services::AppServices;
use crate::server::services::cache_services::CacheStats;
use crate::server::services::metrics_services::MetricsSnapshot;
use crate::server::services::worker_services::WorkerStats;
use crate::server::{get_app_version, get_uptime_seconds};

pub struct StatusController;

impl StatusController {
    pub fn app() -> Router {
        Router::new()
            .route("/status", get(Self::status))
            .route("/cache/stats", get(Self::cache_stats))
            .route("/cache/clear", post(Self::cache_clear))
            .route("/workers/stats", get(Self::worker_stats))
            .route("/metrics", get(Self::metrics))
            .route("/metrics/reset", post(Self::metrics_reset))
    }

    async fn status(Extension(services): Extension<AppServices>) -> Json<StatusResponse> {
        Json(StatusResponse {
            status: "ok".to_string(),
            version: get_app_version().to_string(),
            uptime_seconds: get_uptime_seconds(),
            timestamp: Utc::now(),
            environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
            memory: MemoryStats::sample(),
        })
    }

    async fn cache_stats(Extension(services): Extension<AppServices>) -> Json<CacheStats> {
        Json(services.cache.stats())
    }

    async fn cache_clear(Extension(services): Extension<AppServices>) -> StatusCode {
        services.cache.clear();
        info!("cache cleared via admin endpoint");
        StatusCode::NO_CONTENT
    }

    async fn worker_stats(Extension(services): Extension<AppServices>) -> Json<WorkerStats> {
        Json(services.workers.stats())
    }

    async fn metrics(Extension(services): Extension<AppServices>) -> Json<MetricsSnapshot> {
        Json(services.metrics.snapshot())
    }

    async fn metrics_reset(Extension(services): Extension<AppServices>) -> StatusCode {
        services.metrics.reset();
        info!("metrics reset via admin endpoint");
        StatusCode::NO_CONTENT
    }
}
