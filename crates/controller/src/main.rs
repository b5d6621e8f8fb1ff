//! Capacity Overlay Controller
//!
//! Runs as a single-replica Deployment, turning Savings Plan and Reserved
//! Instance data plus NodePool preference annotations into Karpenter
//! `NodeOverlay` objects.

use anyhow::{Context, Result};
use capacity_overlay_controller::{api, config::ControllerConfig, watch};
use controller_lib::{
    controller::{CostDecisionController, PreferenceController},
    generator::OverlayGenerator,
    health::HealthRegistry,
    observability::{ControllerMetrics, MetricsSink, StructuredLogger},
    reconcile::Reconciler,
    source::PrometheusSource,
    store::{InMemoryOverlayStore, KubeOverlayStore, OverlayStore},
    OwnerRef,
};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{Api, Client, ResourceExt};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Grace period for background tasks after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Resolve our own Deployment as an extra owner; absent on any failure
async fn controller_owner(client: &Client, config: &ControllerConfig) -> Option<OwnerRef> {
    let (namespace, name) = config.controller_deployment_ref()?;
    let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);

    match api.get_opt(name).await {
        Ok(Some(deployment)) => {
            let uid = deployment.uid()?;
            info!(namespace = %namespace, deployment = %name, "Resolved controller Deployment owner");
            Some(OwnerRef::deployment(name, uid))
        }
        Ok(None) => {
            warn!(namespace = %namespace, deployment = %name, "Controller Deployment not found, overlays get no controller owner");
            None
        }
        Err(e) => {
            warn!(error = %e, "Failed to look up controller Deployment, overlays get no controller owner");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting capacity-overlay-controller");

    let config = ControllerConfig::load()?;
    info!(
        prometheus_url = %config.prometheus_url,
        interval_secs = config.reconcile_interval_secs,
        threshold = config.decision.utilization_threshold,
        "Controller configured"
    );

    let logger = StructuredLogger::new("controller");
    logger.log_startup(CONTROLLER_VERSION, config.disabled, config.dry_run);

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let registry = Registry::new();
    let metrics: Arc<dyn MetricsSink> = Arc::new(
        ControllerMetrics::new(&registry).context("Failed to register controller metrics")?,
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let store: Arc<dyn OverlayStore> = if config.dry_run {
        warn!("Dry run: overlay writes go to an in-memory store");
        Arc::new(InMemoryOverlayStore::new())
    } else {
        Arc::new(KubeOverlayStore::new(client.clone()))
    };

    let reconciler = Reconciler::new(store, metrics.clone())
        .with_controller_owner(controller_owner(&client, &config).await);

    let source = PrometheusSource::new(
        &config.prometheus_url,
        config.account_id.clone(),
        config.query_timeout(),
    )
    .context("Failed to create metrics source")?;

    let decision_controller = CostDecisionController::builder()
        .source(Arc::new(source))
        .reconciler(reconciler.clone())
        .metrics(metrics.clone())
        .health(health_registry.clone())
        .decision(config.decision)
        .freshness(config.freshness)
        .disabled(config.disabled)
        .interval(config.reconcile_interval())
        .build()?;

    let preference_controller = Arc::new(PreferenceController::new(
        reconciler,
        OverlayGenerator::new(config.disabled),
        metrics,
    ));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let decision_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { decision_controller.run(shutdown).await })
    };

    let watch_handle = tokio::spawn(watch::run(
        watch::nodepool_api(client),
        preference_controller,
        health_registry.clone(),
        shutdown_tx.subscribe(),
    ));

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry, registry));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");

    let _ = shutdown_tx.send(());
    for (name, handle) in [("decision_loop", decision_handle), ("preference_watcher", watch_handle)] {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!(task = name, "Task did not stop within the grace period");
        }
    }
    api_handle.abort();

    info!("Shutdown complete");
    Ok(())
}
