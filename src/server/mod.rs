use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router};
use once_cell::sync::Lazy;
use tracing::info;

use crate::config::AppConfig;

pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

pub use services::AppServices;

use api::proxy_controller::ProxyController;
use api::status_controller::StatusController;

static SERVER_START: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    SERVER_START.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct ApplicationServer;

impl ApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        // pin the uptime clock before the first request can ask for it
        Lazy::force(&SERVER_START);

        let services = AppServices::new(config.clone());

        // admin routes first so the inline-url wildcard can't swallow them
        let router = Router::new()
            .merge(StatusController::app())
            .merge(ProxyController::app())
            .layer(Extension(services.clone()));

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
            .await
            .context("failed to bind listener")?;

        info!("proxy listening on 0.0.0.0:{}", config.port);

        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await
            .context("server loop failed")?;

        // let queued decompressions finish before the process goes away
        services.workers.shutdown().await;

        Ok(())
    }
}
