use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use wardrobe_pipeline::{
    config::AppConfig,
    db::{self, items::PgItemRepository},
    services::{
        ai::WorkersAiClient,
        analysis::AnalysisContext,
        queue::JobQueue,
        registry,
        storage::R2Client,
    },
};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting wardrobe analysis worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Workers serve no HTTP routes, so the exporter runs its own listener.
    match config.worker_metrics_addr.parse::<SocketAddr>() {
        Ok(addr) => {
            let installed = metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install();
            match installed {
                Ok(()) => tracing::info!(%addr, "Metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "Metrics exporter unavailable"),
            }
        }
        Err(e) => tracing::warn!(
            addr = %config.worker_metrics_addr,
            error = %e,
            "Invalid WORKER_METRICS_ADDR, metrics disabled"
        ),
    }
    metrics::describe_histogram!(
        "queue_job_processing_seconds",
        "Time spent in one job attempt"
    );
    metrics::describe_counter!("queue_jobs_completed_total", "Jobs that completed");
    metrics::describe_counter!("queue_jobs_retried_total", "Failed attempts scheduled for retry");
    metrics::describe_counter!("queue_jobs_failed_total", "Jobs that exhausted their attempts");

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Initializing services");
    let storage = R2Client::new(
        &config.r2_bucket,
        &config.r2_endpoint,
        &config.r2_access_key,
        &config.r2_secret_key,
    )
    .expect("Failed to initialize R2 client");

    let ai = WorkersAiClient::new(&config.cf_account_id, &config.cf_api_token)
        .expect("Failed to initialize Workers AI client");

    let queue = JobQueue::redis(&config.redis_url, &config.queue_prefix, config.queue_options())
        .expect("Failed to initialize job queue");
    let queue = Arc::new(queue);

    let ctx = AnalysisContext {
        storage: Arc::new(storage),
        ai: Arc::new(ai),
        items: Arc::new(PgItemRepository::new(db_pool)),
        model: config.ai_model.clone(),
    };

    let mut handles = registry::start_workers(&queue, &ctx, &config.worker_options());
    tracing::info!(pools = handles.len(), "Worker ready, processing jobs");

    let stopped = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, draining in-flight jobs");
            Ok(())
        }
        result = registry::any_stopped(&mut handles) => {
            tracing::error!("Worker pool stopped unexpectedly");
            result
        }
    };

    let closed = registry::close_workers(handles).await;

    match stopped.and(closed) {
        Ok(()) => {
            tracing::info!("Worker shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker exiting after queue failure");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
