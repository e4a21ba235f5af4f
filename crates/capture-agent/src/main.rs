//! Capture Agent - per-node pod packet capture
//!
//! This binary runs as a DaemonSet on each Kubernetes node, watching pods
//! and running a capture process for every local pod that asks for one.

use anyhow::{Context, Result};
use capture_agent::{api, config::AgentConfig, config::BootstrapError};
use capture_lib::{
    controller::CaptureController,
    health::{components, HealthRegistry},
    observability::{AgentMetrics, StructuredLogger},
    runner::ProcessRunner,
    source::PodEventSource,
};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting capture-agent");

    // Load configuration
    let config = AgentConfig::load().context("failed to load agent configuration")?;
    info!(
        node_name = %config.node_name,
        capture_dir = %config.capture_dir.display(),
        "Agent configured"
    );

    let client = kube::Client::try_default()
        .await
        .map_err(BootstrapError::from)?;

    // Initialize health registry
    let health_registry = HealthRegistry::new();
    health_registry.register(components::EVENT_SOURCE).await;
    health_registry.register(components::CONTROLLER).await;

    let metrics = AgentMetrics::new();

    let logger = StructuredLogger::new(config.node_name.clone());
    logger.log_startup(AGENT_VERSION, &config.capture_annotation);

    let runner = Arc::new(ProcessRunner::new(config.runner_config()));
    let controller = Arc::new(CaptureController::new(
        config.controller_config(),
        runner,
        health_registry.clone(),
        metrics,
    ));

    // Create shared application state
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        controller.clone(),
    ));

    // Start health and metrics server
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            warn!(error = %e, "API server stopped");
        }
    });

    // Readiness is set by the source once the initial listing is dispatched
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let source = PodEventSource::new(client, controller.clone(), health_registry, metrics);
    let source_handle = tokio::spawn(source.run(shutdown_rx));

    let signal_name = wait_for_signal().await?;
    info!(signal = signal_name, "Shutdown signal received");

    let _ = shutdown_tx.send(());
    if let Err(e) = source_handle.await {
        warn!(error = %e, "Pod watch task failed");
    }

    let stopped = controller.shutdown().await;
    info!(captures_stopped = stopped, "Shutdown complete");

    Ok(())
}

/// Wait for SIGINT or SIGTERM and return its name
async fn wait_for_signal() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}
