//! Health endpoint and general HTTP behaviour.

mod common;

use axum::http::StatusCode;
use common::{body_json, get, TestApp};

#[tokio::test]
async fn health_reports_backend_fleet() {
    let app = TestApp::new().await;
    let response = get(app.router(), "/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["backends_online"], 1);
    assert_eq!(json["backends_total"], 1);
}

#[tokio::test]
async fn health_is_degraded_when_every_backend_is_down() {
    let app = TestApp::new().await;
    app.engine
        .registry
        .update_status("gpu-1", Default::default())
        .await;

    let json = body_json(get(app.router(), "/health").await).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["backends_online"], 0);
}

#[tokio::test]
async fn responses_carry_a_request_id() {
    let app = TestApp::new().await;
    let response = get(app.router(), "/health").await;

    let request_id = response
        .headers()
        .get("x-request-id")
        .expect("x-request-id header");
    assert_eq!(request_id.to_str().unwrap().len(), 36);
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = TestApp::new().await;
    let response = get(app.router(), "/api/does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn backends_list_hides_credentials() {
    let app = TestApp::new().await;
    let response = get(app.router(), "/api/backends").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    let backends = json["data"].as_array().unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0]["id"], "gpu-1");
    assert_eq!(backends[0]["status"]["online"], true);
    assert_eq!(backends[0]["available"], true);
    assert!(backends[0].get("auth_token").is_none());
}
