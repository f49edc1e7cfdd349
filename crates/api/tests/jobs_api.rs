//! `/api/jobs` and `/api/projects/run` endpoints.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, get, post_json, TestApp};
use serde_json::{json, Value};
use uuid::Uuid;

fn input_to_output(file: &std::path::Path) -> Value {
    json!({
        "nodes": [
            {"id": "in", "type": "INPUT", "config": {"file_path": file}},
            {"id": "out", "type": "OUTPUT"}
        ],
        "connections": [{"source": "in", "target": "out"}]
    })
}

async fn wait_for_job(app: &TestApp, job_id: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let json = body_json(get(app.router(), &format!("/api/jobs/{job_id}")).await).await;
        let status = json["data"]["status"].as_str().unwrap_or_default().to_string();
        if status == "completed" || status == "failed" {
            return json["data"].clone();
        }
        assert!(tokio::time::Instant::now() < deadline, "job never finished");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn created_job_runs_in_the_background() {
    let app = TestApp::new().await;
    let file = app.dir.path().join("face.png");
    std::fs::write(&file, b"png").unwrap();

    let response = post_json(app.router(), "/api/jobs", json!({"canvas": input_to_output(&file)})).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "pending");
    let job_id = json["data"]["id"].as_str().unwrap().to_string();

    let job = wait_for_job(&app, &job_id).await;
    assert_eq!(job["status"], "completed");
    assert!(job["outputs"]["out"].is_object());

    let list = body_json(get(app.router(), "/api/jobs").await).await;
    assert_eq!(list["data"][0]["id"], job_id.as_str());
    assert_eq!(list["data"][0]["progress"], 100);
    assert!(list["data"][0].get("canvas").is_none());
}

#[tokio::test]
async fn cyclic_canvas_is_rejected() {
    let app = TestApp::new().await;
    let canvas = json!({
        "nodes": [{"id": "a", "type": "MERGE"}, {"id": "b", "type": "MERGE"}],
        "connections": [{"source": "a", "target": "b"}, {"source": "b", "target": "a"}]
    });
    let response = post_json(app.router(), "/api/jobs", json!({"canvas": canvas})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(json["error"].as_str().unwrap().contains("cycle"));
}

#[tokio::test]
async fn unknown_job_is_404() {
    let app = TestApp::new().await;
    let id = Uuid::new_v4();

    let response = get(app.router(), &format!("/api/jobs/{id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = post_json(app.router(), &format!("/api/jobs/{id}/cancel"), json!({})).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancelling_a_finished_job_conflicts() {
    let app = TestApp::new().await;
    let file = app.dir.path().join("face.png");
    std::fs::write(&file, b"png").unwrap();
    let json = body_json(
        post_json(app.router(), "/api/jobs", json!({"canvas": input_to_output(&file)})).await,
    )
    .await;
    let job_id = json["data"]["id"].as_str().unwrap().to_string();
    wait_for_job(&app, &job_id).await;

    let response = post_json(app.router(), &format!("/api/jobs/{job_id}/cancel"), json!({})).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn project_run_creates_one_job_per_stream() {
    let app = TestApp::new().await;
    let file = app.dir.path().join("face.png");
    std::fs::write(&file, b"png").unwrap();

    let project = json!({
        "id": Uuid::new_v4(),
        "name": "two streams",
        "canvas": {
            "nodes": [
                {"id": "in1", "type": "INPUT", "config": {"file_path": &file}},
                {"id": "x1", "type": "EXECUTE"},
                {"id": "in2", "type": "INPUT", "config": {"file_path": &file}},
                {"id": "x2", "type": "EXECUTE"},
                {"id": "idle", "type": "INPUT", "config": {"file_path": &file}}
            ],
            "connections": [
                {"source": "in1", "target": "x1"},
                {"source": "in2", "target": "x2"}
            ]
        }
    });
    let response = post_json(app.router(), "/api/projects/run", json!({"project": project})).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    let jobs = json["data"].as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    for job in jobs {
        let done = wait_for_job(&app, job["id"].as_str().unwrap()).await;
        assert_eq!(done["status"], "completed");
        assert!(done["stream_index"].is_number());
    }
}
