//! Integration tests for the REST API
//!
//! Drives the router with `oneshot` against an orchestrator backed by the mock
//! adapter, an in-memory object store and a manual clock.

mod common;

use axum::http::{header, StatusCode};
use common::{extract_json_body, TestClient};
use devenv_core::ErrorKind;
use devenv_orchestrator::test_utils::TestHarness;
use devenv_orchestrator::{Environment, EnvironmentStatus, SweepReport};
use devenv_provider::mock::MockOp;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::test]
async fn test_health_endpoints() {
    let client = TestClient::new().await;

    let response = client.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "devenv-api");

    let response = client.get("/health/ready").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["status"], "ready");
    assert_eq!(body["database"], "connected");
}

#[tokio::test]
async fn test_create_is_idempotent_per_project() {
    let client = TestClient::new().await;

    let first = client.create(42, 7).await;
    let second = client.create(42, 7).await;
    let other = client.create(42, 8).await;

    assert_eq!(first, second);
    assert_ne!(first, other);

    let response = client.get(&format!("/api/v1/environments/{first}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let status: EnvironmentStatus = extract_json_body(response).await;
    assert_eq!(status.state.as_str(), "absent");
    assert!(status.host.is_none());
}

#[tokio::test]
async fn test_create_rejects_malformed_body() {
    let client = TestClient::new().await;

    let response = client
        .post("/api/v1/environments", &json!({ "owner_id": "not-a-number" }))
        .await;

    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_unknown_environment_is_404() {
    let client = TestClient::new().await;

    let response = client.get("/api/v1/environments/does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"]["kind"], "not_found");

    let response = client
        .post_empty("/api/v1/environments/does-not-exist/start")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .get("/api/v1/environments/does-not-exist/operations")
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_start_is_accepted_and_reaches_running() {
    let client = TestClient::new().await;
    let id = client.create(42, 7).await;

    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/start"))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["environment_id"], id.as_str());

    client.harness.settle().await;

    let response = client.get(&format!("/api/v1/environments/{id}")).await;
    let status: EnvironmentStatus = extract_json_body(response).await;
    assert_eq!(status.state.as_str(), "running");
    assert_eq!(status.host.as_deref(), Some("user42-project7.dev.localhost"));
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_invalid_trigger_is_conflict() {
    let client = TestClient::new().await;
    let id = client.create(1, 1).await;

    // Nothing to stop or touch yet.
    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/stop"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"]["kind"], "invalid_transition");

    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/touch"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let env = client.harness.orchestrator.get_environment(&id).await.unwrap();
    assert_eq!(env.state.as_str(), "absent");
    assert_eq!(env.version, 0);
}

#[tokio::test]
async fn test_touch_returns_current_status() {
    let client = TestClient::new().await;
    let id = client.harness.running(3, 4).await;

    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/touch"))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["accepted"], true);
    assert_eq!(body["state"], "running");
    assert_eq!(body["host"], "user3-project4.dev.localhost");
}

#[tokio::test]
async fn test_list_filters_by_owner_and_state() {
    let client = TestClient::new().await;
    let running = client.harness.running(5, 1).await;
    client.create(5, 2).await;
    client.create(6, 1).await;

    let response = client.get("/api/v1/environments?owner_id=5").await;
    assert_eq!(response.status(), StatusCode::OK);
    let envs: Vec<Environment> = extract_json_body(response).await;
    assert_eq!(envs.len(), 2);
    assert!(envs.iter().all(|e| e.owner_id == 5));

    let response = client.get("/api/v1/environments?state=running").await;
    let envs: Vec<Environment> = extract_json_body(response).await;
    assert_eq!(envs.len(), 1);
    assert_eq!(envs[0].id, running);

    let response = client.get("/api/v1/environments").await;
    let envs: Vec<Environment> = extract_json_body(response).await;
    assert_eq!(envs.len(), 3);
}

#[tokio::test]
async fn test_list_rejects_unknown_state() {
    let client = TestClient::new().await;

    let response = client.get("/api/v1/environments?state=sleeping").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["error"]["kind"], "invalid_request");
}

#[tokio::test]
async fn test_stop_hibernates_and_records_operations() {
    let client = TestClient::new().await;
    let id = client.harness.running(8, 8).await;

    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/stop"))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    client.harness.settle().await;

    let response = client.get(&format!("/api/v1/environments/{id}")).await;
    let status: EnvironmentStatus = extract_json_body(response).await;
    assert_eq!(status.state.as_str(), "hibernated");
    assert!(status.host.is_none());

    let response = client
        .get(&format!("/api/v1/environments/{id}/operations"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let ops: Vec<Value> = extract_json_body(response).await;
    let types: Vec<&str> = ops
        .iter()
        .filter_map(|op| op["operation_type"].as_str())
        .collect();
    assert!(types.contains(&"create"));
    assert!(types.contains(&"start"));
    assert!(types.contains(&"stop"));
    assert!(ops.iter().all(|op| op["status"] == "success"));

    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/stop"))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_delete_is_accepted_and_purges_absent_record() {
    let client = TestClient::new().await;
    let id = client.create(2, 2).await;

    let response = client.delete(&format!("/api/v1/environments/{id}")).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    client.harness.settle().await;

    let response = client.get(&format!("/api/v1/environments/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_quota_failure_surfaces_in_status() {
    let client = TestClient::new().await;
    client
        .harness
        .adapter
        .fail_next(MockOp::Provision, ErrorKind::QuotaExceeded, 1);
    let id = client.create(9, 9).await;

    let response = client
        .post_empty(&format!("/api/v1/environments/{id}/start"))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    client.harness.settle().await;

    let response = client.get(&format!("/api/v1/environments/{id}")).await;
    let body: Value = extract_json_body(response).await;
    assert_eq!(body["state"], "failed");
    assert_eq!(body["last_error"]["kind"], "quota_exceeded");
    assert!(body["host"].is_null());
}

#[tokio::test]
async fn test_reaper_sweep_endpoint() {
    let client = TestClient::new().await;
    let id = client.harness.running(4, 2).await;

    let response = client.post_empty("/api/v1/reaper/sweep").await;
    assert_eq!(response.status(), StatusCode::OK);
    let report: SweepReport = extract_json_body(response).await;
    assert_eq!(report.candidates, 0);

    client.harness.clock.advance(chrono::Duration::minutes(31));

    let response = client.post_empty("/api/v1/reaper/sweep").await;
    let report: SweepReport = extract_json_body(response).await;
    assert_eq!(report.candidates, 1);
    assert_eq!(report.hibernated, 1);

    let status = client.harness.orchestrator.get_status(&id).await.unwrap();
    assert_eq!(status.state.as_str(), "hibernated");
}

#[tokio::test]
async fn test_event_stream_delivers_transitions() {
    let client = TestClient::from_harness(TestHarness::new().await);
    let id = client.create(42, 7).await;

    let response = client
        .get(&format!("/api/v1/events?environment_id={id}"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    // The subscription is taken when the handler runs, before the start.
    client.harness.orchestrator.start_environment(&id).await.unwrap();

    let mut frames = response.into_body().into_data_stream();
    let mut seen = String::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !seen.contains("\"new_state\":\"running\"") {
        let chunk = tokio::time::timeout_at(deadline, frames.next())
            .await
            .expect("no running event before deadline")
            .expect("stream ended")
            .expect("stream error");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }

    assert!(seen.contains("event: lifecycle"));
    let provisioning = seen.find("\"new_state\":\"provisioning\"").unwrap();
    let hydrating = seen.find("\"new_state\":\"hydrating\"").unwrap();
    let running = seen.find("\"new_state\":\"running\"").unwrap();
    assert!(provisioning < hydrating && hydrating < running);
}
