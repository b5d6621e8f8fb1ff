//! Integration tests for the controller API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use capacity_overlay_controller::api::{create_router, AppState};
use controller_lib::{
    health::{components, HealthRegistry},
    observability::{ControllerMetrics, MetricsSink},
    reconcile::ReconcileOp,
    OverlayType,
};
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    metrics: ControllerMetrics,
}

async fn setup_test_app() -> TestApp {
    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let registry = Registry::new();
    let metrics = ControllerMetrics::new(&registry).unwrap();
    let state = Arc::new(AppState::new(health_registry, registry));

    TestApp {
        router: create_router(state.clone()),
        state,
        metrics,
    }
}

async fn get(router: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app().await;

    let (status, body) = get(app.router, "/healthz").await;
    assert_eq!(status, StatusCode::OK);

    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    for name in components::ALL {
        assert!(health["components"][name].is_object(), "missing {}", name);
    }
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app().await;
    app.state
        .health_registry
        .set_degraded(components::CAPACITY_SOURCE, "capacity query failed")
        .await;

    let (status, body) = get(app.router, "/healthz").await;

    // Degraded is still operational
    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"][components::CAPACITY_SOURCE]["message"],
        "capacity query failed"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;
    app.state
        .health_registry
        .set_unhealthy(components::PREFERENCE_WATCHER, "watch stream ended")
        .await;

    let (status, body) = get(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_waits_for_first_cycle() {
    let app = setup_test_app().await;

    let (status, body) = get(app.router.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], false);

    app.state.health_registry.record_cycle().await;

    let (status, body) = get(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    let readiness: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_cycled_but_unhealthy() {
    let app = setup_test_app().await;
    app.state.health_registry.record_cycle().await;
    app.state
        .health_registry
        .set_unhealthy(components::OVERLAY_STORE, "store unreachable")
        .await;

    let (status, _) = get(app.router, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_serves_owned_registry() {
    let app = setup_test_app().await;
    app.metrics
        .record_operation(OverlayType::CostDecision, ReconcileOp::Create, true);
    app.metrics.record_pass(OverlayType::Preference, "success");
    app.metrics.observe_cycle_duration(Duration::from_millis(250));

    let response = app
        .router
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("capacity_overlay_operations_total"));
    assert!(text.contains(r#"origin="cost-decision""#));
    assert!(text.contains(r#"operation="create""#));
    assert!(text.contains("capacity_overlay_reconcile_passes_total"));
    assert!(text.contains("capacity_overlay_cycle_duration_seconds_bucket"));
    assert!(text.contains("capacity_overlay_cycle_duration_seconds_count"));
}
