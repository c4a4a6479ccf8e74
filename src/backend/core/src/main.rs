//! Sutra Server - Main entry point

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sutra_core::{
    api::{self, AppState},
    config::Config,
    jobs::{
        build_notifier, open_store, ApiKeyAuthorizer, CommandStepExecutor, JobPipeline,
        PipelineConfig, Scheduler, SchedulerConfig, SubmissionGateway,
    },
    telemetry,
};

/// How long in-flight jobs get to reach a step boundary after the server stops.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;
    let telemetry = telemetry::init_telemetry(&config.telemetry())?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Sutra Server");

    let store = open_store(&config.store).await?;
    tracing::info!(backend = store.backend_name(), "Job store ready");

    let executor = CommandStepExecutor::from_config(&config.executor)?;
    if !executor.has_commands() {
        tracing::info!("No step commands configured, using the simulated executor");
    }

    let pipeline = JobPipeline::new(
        store.clone(),
        Arc::new(executor),
        PipelineConfig::from_engine(&config.engine)?,
    );
    let notifier = build_notifier(&config.notifier)?;
    tracing::info!(sink = notifier.name(), "Notifier ready");

    let scheduler = Scheduler::new(
        store,
        pipeline,
        notifier,
        SchedulerConfig::from_config(&config),
    );

    let recovered = scheduler.recover().await?;
    tracing::info!(recovered, "Recovery sweep complete");
    let workers = scheduler.start();

    let authorizer = Arc::new(ApiKeyAuthorizer::new(&config.auth.api_keys));
    let gateway = SubmissionGateway::new(authorizer, scheduler)
        .with_max_payload_bytes(config.server.body_limit_bytes);

    let app = api::build_router_with_limit(
        AppState::new(gateway, telemetry.metrics),
        config.server.body_limit_bytes,
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server.host/server.port")?;
    tracing::info!(address = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    workers.shutdown();
    if tokio::time::timeout(DRAIN_TIMEOUT, workers.join()).await.is_err() {
        tracing::warn!(
            timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "Workers did not stop in time, unfinished jobs will be recovered on restart"
        );
    }

    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
