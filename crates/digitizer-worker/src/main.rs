//! Digitization worker process.
//!
//! Connects to PostgreSQL, applies migrations, wires the HTTP providers and
//! runs the job worker until interrupted.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use digitizer_db::{Database, PoolConfig, QueueOptions};
use digitizer_jobs::{
    DigitizationHandler, DigitizationService, LoggingObserver, Stores, WorkerBuilder,
    WorkerConfig,
};
use digitizer_providers::Providers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   LOG_FILE    - path to log file (optional, enables file logging)
    //   LOG_ANSI    - "true"/"false" override ANSI colors
    //   RUST_LOG    - standard env filter
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "digitizer_worker=info,digitizer_jobs=info,digitizer_db=info,digitizer_providers=info"
            .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let _file_guard = if let Some(ref path) = log_file {
        let file_dir = std::path::Path::new(path)
            .parent()
            .unwrap_or(std::path::Path::new("."));
        let file_name = std::path::Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("digitizer-worker.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false));
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        if log_format == "json" {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer();
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stdout)"),
        "Logging initialized"
    );

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/digitizer".to_string());
    let queue_options = QueueOptions::from_env();
    let worker_config = WorkerConfig::from_env();

    info!(
        queue = %queue_options.name,
        max_attempts = queue_options.max_attempts,
        backoff_ms = queue_options.backoff.base_delay.as_millis() as u64,
        max_concurrent = worker_config.max_concurrent_jobs,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let db = Database::connect_with_config(&database_url, PoolConfig::from_env(), queue_options)
        .await
        .context("failed to connect to the database")?;

    info!("Running database migrations...");
    db.migrate().await.context("failed to run migrations")?;
    info!("Database migrations complete");

    let providers = Providers::from_env().context("provider configuration is incomplete")?;
    let stores = Stores::from_database(&db);
    let service = DigitizationService::new(
        stores.clone(),
        providers.uploader.clone(),
        providers.downloader.clone(),
    );

    let worker = WorkerBuilder::new(stores.clone())
        .with_config(worker_config)
        .with_handler(DigitizationHandler::new(
            stores,
            providers.recognizer.clone(),
            providers.translator.clone(),
        ))
        .with_reconciler(service)
        .build()
        .await;

    let handle = worker.start();
    let _subscription = handle.observe(Arc::new(LoggingObserver));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received, waiting for in-flight jobs");

    handle.shutdown().await?;
    db.pool().close().await;
    info!("Worker shut down");
    Ok(())
}
