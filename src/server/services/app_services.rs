use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;

use super::cache_services::{DynCacheService, ResponseCacheService};
use super::metrics_services::MetricsService;
use super::proxy_services::ProxyService;
use super::worker_services::{DynWorkerPoolService, WorkerPoolService};

/// everything a request handler needs, cloned into each controller via Extension
#[derive(Clone)]
pub struct AppServices {
    pub proxy: Arc<ProxyService>,
    pub cache: DynCacheService,
    pub workers: DynWorkerPoolService,
    pub metrics: Arc<MetricsService>,
    pub http: reqwest::Client,
    pub config: Arc<AppConfig>,
}

impl AppServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        info!("starting proxy services...");

        // tuned for many concurrent upstream connections on streaming workloads
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(200)
            .connect_timeout(std::time::Duration::from_secs(10))
            .pool_idle_timeout(std::time::Duration::from_secs(120))
            .tcp_keepalive(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        let cache =
            Arc::new(ResponseCacheService::new(config.cache_max_bytes)) as DynCacheService;

        let workers = WorkerPoolService::new(
            config.worker_pool_size(),
            config.worker_queue_depth,
            config.worker_threshold_bytes,
        ) as DynWorkerPoolService;

        let metrics = Arc::new(MetricsService::new());

        let proxy = Arc::new(ProxyService::new(
            http.clone(),
            cache.clone(),
            workers.clone(),
            metrics.clone(),
            config.clone(),
        ));

        info!("proxy services ready");

        Self {
            proxy,
            cache,
            workers,
            metrics,
            http,
            config,
        }
    }
}
