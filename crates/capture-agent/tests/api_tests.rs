//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use capture_agent::api::{create_router, AppState};
use capture_lib::{
    controller::{CaptureController, ControllerConfig},
    health::{components, HealthRegistry},
    models::{WorkloadEvent, WorkloadSnapshot},
    observability::AgentMetrics,
    runner::{ProcessRunner, ProcessRunnerConfig},
    ReconcileOutcome,
};
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: Arc<AppState>,
    _dir: TempDir,
}

/// Build the app around a runner whose capture tool just sleeps
async fn setup_test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let tool = dir.path().join("fake-tcpdump");
    std::fs::write(&tool, "#!/bin/sh\nexec sleep 30\n").unwrap();
    std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

    let health_registry = HealthRegistry::new();
    health_registry.register(components::EVENT_SOURCE).await;
    health_registry.register(components::CONTROLLER).await;

    let runner = Arc::new(ProcessRunner::new(ProcessRunnerConfig {
        binary: tool.to_string_lossy().into_owned(),
        startup_grace: Duration::from_millis(100),
        ..Default::default()
    }));

    let mut config = ControllerConfig::new("node-1");
    config.capture_dir = dir.path().join("captures");

    let metrics = AgentMetrics::new();
    let controller = Arc::new(CaptureController::new(
        config,
        runner,
        health_registry.clone(),
        metrics,
    ));

    let state = Arc::new(AppState::new(health_registry, metrics, controller));
    TestApp {
        router: create_router(state.clone()),
        state,
        _dir: dir,
    }
}

fn annotated_pod(uid: &str, rotation_count: &str) -> WorkloadSnapshot {
    WorkloadSnapshot {
        identity: uid.to_string(),
        namespace: "foo".to_string(),
        name: "bar".to_string(),
        node_name: Some("node-1".to_string()),
        annotations: BTreeMap::from([(
            "tcpdump.antrea.io".to_string(),
            rotation_count.to_string(),
        )]),
        resource_version: Some("1".to_string()),
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

async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(router, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let app = setup_test_app().await;

    let (status, health) = get_json(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let app = setup_test_app().await;

    app.state
        .health_registry
        .set_degraded(components::EVENT_SOURCE, "watch error")
        .await;

    let (status, health) = get_json(app.router, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let app = setup_test_app().await;

    app.state
        .health_registry
        .set_unhealthy(components::EVENT_SOURCE, "pod watch stream ended")
        .await;

    let (status, health) = get_json(app.router, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_healthz_includes_component_details() {
    let app = setup_test_app().await;

    let (_, health) = get_json(app.router, "/healthz").await;

    assert!(health["components"].is_object());
    assert!(health["components"]["event_source"].is_object());
    assert!(health["components"]["controller"].is_object());
}

#[tokio::test]
async fn test_readyz_returns_503_before_initial_sync() {
    let app = setup_test_app().await;

    let (status, readiness) = get_json(app.router, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert_eq!(readiness["reason"], "Initial pod sync not complete");
}

#[tokio::test]
async fn test_readyz_returns_ok_after_initial_sync() {
    let app = setup_test_app().await;

    app.state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app.router, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_unhealthy() {
    let app = setup_test_app().await;

    app.state.health_registry.set_ready(true).await;
    app.state
        .health_registry
        .set_unhealthy(components::CONTROLLER, "Failed")
        .await;

    let (status, _) = get_json(app.router, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_returns_prometheus_format() {
    let app = setup_test_app().await;

    app.state.metrics.inc_launches();
    app.state
        .metrics
        .observe_reconcile_duration(Duration::from_millis(2));

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
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("capture_agent_active_captures"));
    assert!(metrics_text.contains("capture_agent_launches_total"));
    assert!(metrics_text.contains("capture_agent_reconcile_duration_seconds_bucket"));
    assert!(metrics_text.contains("capture_agent_reconcile_duration_seconds_count"));
}

#[tokio::test]
async fn test_captures_empty_without_annotated_pods() {
    let app = setup_test_app().await;

    let (status, captures) = get_json(app.router, "/captures").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(captures, serde_json::json!([]));
}

#[tokio::test]
async fn test_captures_lists_running_capture() {
    let app = setup_test_app().await;
    let controller = app.state.controller.clone();

    let outcome = controller
        .reconcile(WorkloadEvent::add(annotated_pod("uid-a", "3")))
        .await;
    assert_eq!(outcome, ReconcileOutcome::Started { rotation_count: 3 });

    let (status, captures) = get_json(app.router.clone(), "/captures").await;
    assert_eq!(status, StatusCode::OK);

    let list = captures.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["identity"], "uid-a");
    assert_eq!(list[0]["pod"], "foo/bar");
    assert_eq!(list[0]["rotation_count"], 3);
    assert_eq!(list[0]["state"], "running");
    assert!(list[0]["pid"].is_number());
    assert!(list[0]["output_template"]
        .as_str()
        .unwrap()
        .ends_with("uid-a/capture-foo_bar.pcap"));

    assert_eq!(controller.shutdown().await, 1);

    let (_, captures) = get_json(app.router, "/captures").await;
    assert_eq!(captures, serde_json::json!([]));
}
