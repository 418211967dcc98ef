//! Replica Scheduler - time-of-day scaling for Deployments
//!
//! Scales annotated Deployments to zero inside their off-schedule window and
//! restores their replica count outside it.

use anyhow::Result;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use replica_scheduler::{api, config::SchedulerConfig};
use scheduler_lib::{
    client::{connect, DeploymentClient, KubeDeployments},
    health::{Component, HealthRegistry},
    mirror::WorkloadMirror,
    observability::{SchedulerMetrics, StructuredLogger},
    reconciler::Reconciler,
    schedule::{Clock, SystemClock},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting replica-scheduler");

    let config = SchedulerConfig::load()?;
    info!(
        namespace = config.namespace.as_deref().unwrap_or("*"),
        api_port = config.api_port,
        "Scheduler configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry
        .set_degraded(Component::Mirror, "waiting for initial listing")
        .await;
    health_registry.register(Component::Reconciler).await;

    let metrics = SchedulerMetrics::new();
    let logger = StructuredLogger::new(&config.instance_name);

    let client = connect(config.kubeconfig.as_deref()).await?;
    let deployments: Arc<dyn DeploymentClient> = Arc::new(KubeDeployments::new(client.clone()));
    let watched: Api<Deployment> = match &config.namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mirror = Arc::new(WorkloadMirror::new(config.mirror_config()));
    let mirror_handle = {
        let mirror = mirror.clone();
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { mirror.run(watched, shutdown).await })
    };

    // Ready once the first listing has landed
    {
        let mirror = mirror.clone();
        let health = health_registry.clone();
        let timeout = config.reconciler_config().cache_sync_timeout;
        tokio::spawn(async move {
            if mirror.wait_for_sync(timeout).await {
                health.set_healthy(Component::Mirror).await;
                health.open().await;
            } else {
                health
                    .set_unhealthy(Component::Mirror, "workload cache did not sync")
                    .await;
            }
        });
    }

    let clock: Arc<dyn Clock> = Arc::new(if config.use_utc {
        SystemClock::utc()
    } else {
        SystemClock::local()
    });
    let reconciler = Reconciler::new(
        deployments.clone(),
        mirror.clone(),
        clock,
        config.reconciler_config(),
    )
    .with_health(health_registry.clone())
    .with_logger(logger.clone());
    let mut reconciler_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        logger.clone(),
        deployments,
    ));
    let mut api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    logger.log_startup(api::VERSION, config.tick_interval_secs, config.use_utc);

    let mut fatal = None;
    // set when the select below has already consumed a handle
    let mut reconciler_done = false;
    let mut api_done = false;
    tokio::select! {
        reason = shutdown_signal() => logger.log_shutdown(reason),
        result = &mut reconciler_handle => {
            reconciler_done = true;
            match result {
                Ok(Err(e)) => {
                    logger.log_shutdown("reconciler failed");
                    fatal = Some(anyhow::Error::new(e));
                }
                Ok(Ok(())) => logger.log_shutdown("reconciler stopped"),
                Err(e) => {
                    logger.log_shutdown("reconciler panicked");
                    fatal = Some(anyhow::Error::new(e));
                }
            }
        }
        result = &mut api_handle => {
            api_done = true;
            logger.log_shutdown("API server stopped");
            fatal = Some(match result {
                Ok(Err(e)) => e.context("API server failed"),
                Ok(Ok(())) => anyhow::anyhow!("API server stopped unexpectedly"),
                Err(e) => anyhow::Error::new(e).context("API server task failed"),
            });
        }
    }

    health_registry.hold("shutting down").await;
    info!(
        wait_secs = config.shutdown_wait_secs,
        "Marked not ready, waiting before stopping"
    );
    tokio::time::sleep(config.shutdown_wait()).await;
    let _ = shutdown_tx.send(());

    if let Err(e) = mirror_handle.await {
        warn!(error = %e, "Workload mirror task failed");
    }
    if !api_done {
        match api_handle.await {
            Ok(Err(e)) => error!(error = %e, "API server failed"),
            Err(e) => warn!(error = %e, "API server task failed"),
            Ok(Ok(())) => {}
        }
    }
    if !reconciler_done {
        let _ = reconciler_handle.await;
    }

    info!("Shutdown complete");
    match fatal {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
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
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}
