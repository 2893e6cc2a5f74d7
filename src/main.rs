mod api;
mod config;
mod credentials;
mod db;
mod dispatch;
mod error;
mod fcm;
mod filter;
mod gateway;
mod geo;
mod logging;
mod metrics;
mod models;
mod partition;
mod registry;
mod repository;
mod scheduler;
mod service;
mod stats;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::{signal, sync::oneshot};
use tracing::{error, info};

use credentials::FsCredentialStore;
use fcm::FcmGatewayFactory;
use registry::TenantRegistry;
use repository::Repositories;
use scheduler::ScheduledDispatchLoop;
use service::NotificationService;

fn main() -> Result<()> {
    // Build custom runtime with explicit thread configuration
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(num_cpus::get);

    println!("Starting with {} Tokio worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        // Initialize logging first thing
        logging::setup_logging();

        // Load environment variables from .env file if present
        dotenv::dotenv().ok();

        info!("Starting multi-tenant push notification service");

        let config = config::Config::from_env()?;

        let db_pool = db::init_db_pool(&config.database_url, config.db_max_connections)
            .await
            .context("failed to initialize database")?;
        let repos = Repositories::from_store(Arc::new(db::PgStore::new(db_pool)));

        let credentials = Arc::new(FsCredentialStore::new(&config.credentials_dir));
        let gateways = Arc::new(FcmGatewayFactory::new(
            config.fcm_api_url.clone(),
            config.fcm_send_concurrency,
        )?);
        let registry = Arc::new(TenantRegistry::new(credentials.clone(), gateways));

        // Nothing should survive from a previous process, but start clean.
        registry.invalidate_all().await;

        let service = Arc::new(NotificationService::new(
            repos.clone(),
            credentials,
            registry,
        ));

        let scheduler = Arc::new(ScheduledDispatchLoop::new(
            service.clone(),
            repos.scheduled.clone(),
        ));
        let scheduler_handle = scheduler.start(config.scheduler_interval);

        // Spawn API server
        let api_state = Arc::new(api::ApiState {
            service,
            dispatch_timeout: config.dispatch_timeout,
        });
        let api_router = api::create_api_router(api_state);

        let listener = tokio::net::TcpListener::bind(&config.api_bind_address)
            .await
            .with_context(|| format!("failed to bind {}", config.api_bind_address))?;
        info!("Starting API server on {}", config.api_bind_address);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let api_handle = tokio::spawn(async move {
            let server = axum::serve(listener, api_router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        });

        // Handle graceful shutdown
        signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("Received shutdown signal, shutting down gracefully");

        scheduler_handle.stop().await;
        let _ = shutdown_tx.send(());
        let _ = api_handle.await;

        info!("Shutdown complete");
        Ok(())
    })
}
