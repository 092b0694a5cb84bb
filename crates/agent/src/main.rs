//! Pod GPU Agent - per-pod GPU memory exporter
//!
//! This binary runs as a DaemonSet on each GPU node, attributing the GPU
//! memory used by every process to the Kubernetes pod that owns it and
//! exposing the result as Prometheus gauges.

use anyhow::{Context, Result};
use gpu_agent_lib::{
    enumerator::create_enumerator,
    health::{components, HealthRegistry},
    inventory::{self, KubePodLister, PodLister},
    observability::StructuredLogger,
    refresh::RefreshLoopBuilder,
    telemetry::NvmlTelemetry,
};
use prometheus::Registry;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pod-gpu-agent");

    let config = config::AgentConfig::load()?;
    info!(
        node_name = %config.node_label(),
        enumerator = ?config.enumerator,
        restrict_to_node = config.restrict_to_node,
        "Agent configured"
    );

    let logger = StructuredLogger::new(config.node_label());

    let health_registry = HealthRegistry::with_components(components::ALL).await;

    // Gauges and self-metrics share one registry, served by /metrics
    let registry = Registry::new();

    let telemetry = NvmlTelemetry::init().context("GPU driver initialization failed")?;

    let client = inventory::connect(config.kubeconfig.as_deref())
        .await
        .context("Kubernetes client initialization failed")?;
    let pods: Arc<dyn PodLister> = match (&config.node_name, config.restrict_to_node) {
        (Some(node), true) => Arc::new(KubePodLister::with_node(client, node.clone())),
        _ => Arc::new(KubePodLister::new(client)),
    };

    let enumerator =
        create_enumerator(config.enumerator, &config.kubectl_path, &config.cgroup_root).await;

    let refresh = RefreshLoopBuilder::new()
        .pod_lister(pods)
        .enumerator(enumerator)
        .telemetry(Arc::new(telemetry))
        .registry(registry.clone())
        .health(health_registry.clone())
        .logger(logger.clone())
        .interval(config.refresh_interval())
        .call_timeout(config.call_timeout())
        .enumeration_concurrency(config.enumeration_concurrency)
        .build()?;

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), registry));
    let mut api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut refresh_handle = tokio::spawn(refresh.run(shutdown_rx));

    logger.log_startup(AGENT_VERSION, config.refresh_interval_secs);

    tokio::select! {
        reason = shutdown_signal() => {
            let reason = reason?;
            logger.log_shutdown(reason);
            let _ = shutdown_tx.send(());
            // An in-flight cycle is bounded by the call timeouts
            let grace = config.call_timeout() * 3;
            if tokio::time::timeout(grace, &mut refresh_handle).await.is_err() {
                warn!(grace_secs = grace.as_secs(), "Refresh cycle still running, abandoning it");
            }
            Ok(())
        }
        result = &mut refresh_handle => {
            let result = result.context("Refresh loop task failed")?;
            if let Err(e) = result {
                error!(error = %e, "Refresh loop stopped on fatal error");
                logger.log_shutdown("fatal error");
                return Err(e.into());
            }
            Ok(())
        }
        result = &mut api_handle => {
            logger.log_shutdown("API server stopped");
            result
                .context("API server task failed")?
                .context("API server failed")?;
            anyhow::bail!("API server exited unexpectedly")
        }
    }
}

/// Wait for SIGINT or SIGTERM, returning which one arrived
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => Ok("SIGTERM received"),
            _ = sigint.recv() => Ok("SIGINT received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("SIGINT received")
    }
}
