//! Common test utilities and helpers for devenv-api tests

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, Response},
    Router,
};
use devenv_api::{create_app, AppState};
use devenv_orchestrator::test_utils::TestHarness;
use tower::ServiceExt;

/// Build the router over a harness orchestrator.
pub fn create_test_app(harness: &TestHarness) -> Router {
    create_app(AppState::new(harness.orchestrator.clone()))
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub harness: TestHarness,
}

impl TestClient {
    pub async fn new() -> Self {
        Self::from_harness(TestHarness::new().await)
    }

    pub fn from_harness(harness: TestHarness) -> Self {
        let app = create_test_app(&harness);
        Self { app, harness }
    }

    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        self.app.clone().oneshot(request).await.unwrap()
    }

    pub async fn post<T: serde::Serialize>(&self, uri: &str, body: &T) -> Response<Body> {
        let req_body = serde_json::to_string(body).expect("Failed to serialize request body");
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(req_body))
            .unwrap();
        self.send_request(request).await
    }

    /// POST without a body, as used by the trigger endpoints.
    pub async fn post_empty(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    pub async fn delete(&self, uri: &str) -> Response<Body> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    /// Create an environment over HTTP and return its id.
    pub async fn create(&self, owner_id: i64, project_id: i64) -> String {
        let response = self
            .post(
                "/api/v1/environments",
                &serde_json::json!({ "owner_id": owner_id, "project_id": project_id }),
            )
            .await;
        assert!(response.status().is_success(), "create failed: {}", response.status());
        let body: serde_json::Value = extract_json_body(response).await;
        body["id"].as_str().expect("id in response").to_string()
    }
}
