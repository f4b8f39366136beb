pub mod app_services;
pub mod cache_services;
pub mod metrics_services;
pub mod proxy_services;
pub mod worker_services;

pub use app_services::AppServices;
pub use cache_services::DynCacheService;
pub use worker_services::DynWorkerPoolService;
