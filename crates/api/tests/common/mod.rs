//! Router harness for API integration tests: an engine over temporary
//! directories, a scripted backend and request helpers.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use canvasflow_comfyui::{
    BackendClient, BackendError, OutputFile, ProgressChannel, ProgressUpdate, SystemStats,
};
use canvasflow_core::backend::{BackendConfig, BackendStatus};
use canvasflow_events::EventBus;
use canvasflow_pipeline::config::EngineConfig;
use canvasflow_pipeline::workflows::MemoryWorkflows;
use canvasflow_pipeline::{BackendRegistry, Engine, MemoryJobStore};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use canvasflow_api::config::ServerConfig;
use canvasflow_api::router::build_app_router;
use canvasflow_api::state::AppState;
use canvasflow_api::ws::WsManager;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
    }
}

// ---------------------------------------------------------------------------
// Scripted backend
// ---------------------------------------------------------------------------

/// Accepts every prompt and finishes it immediately with one image.
pub struct InstantBackend {
    id: String,
}

impl InstantBackend {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl BackendClient for InstantBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn system_stats(&self) -> Result<SystemStats, BackendError> {
        Ok(SystemStats {
            vram_total: 24 << 30,
            vram_free: 20 << 30,
            devices: vec!["cuda:0".to_string()],
        })
    }

    async fn queue_depth(&self) -> Result<u32, BackendError> {
        Ok(0)
    }

    async fn open_progress(&self) -> Result<Box<dyn ProgressChannel>, BackendError> {
        Ok(Box::new(Instant {
            client_id: format!("{}-client", self.id),
            sent: false,
        }))
    }

    async fn submit(&self, _workflow: &Value, _client_id: &str) -> Result<String, BackendError> {
        Ok(format!("{}-prompt", self.id))
    }

    async fn history(&self, _prompt_id: &str) -> Result<Value, BackendError> {
        Ok(json!({}))
    }

    async fn collect_outputs(&self, _prompt_id: &str) -> Result<Vec<OutputFile>, BackendError> {
        Ok(vec![OutputFile {
            node_id: "9".to_string(),
            filename: "out.png".to_string(),
            subfolder: String::new(),
            kind: "output".to_string(),
        }])
    }

    async fn download(&self, file: &OutputFile, dest_dir: &Path) -> Result<PathBuf, BackendError> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(&file.filename);
        tokio::fs::write(&path, b"png").await?;
        Ok(path)
    }

    async fn upload_media(&self, path: &Path) -> Result<String, BackendError> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload");
        Ok(format!("canvasflow/{name}"))
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn free(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn object_info(&self) -> Result<Value, BackendError> {
        Ok(json!({}))
    }
}

struct Instant {
    client_id: String,
    sent: bool,
}

#[async_trait]
impl ProgressChannel for Instant {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn next_update(
        &mut self,
        _prompt_id: &str,
    ) -> Result<Option<ProgressUpdate>, BackendError> {
        if self.sent {
            return Ok(None);
        }
        self.sent = true;
        Ok(Some(ProgressUpdate::Completed))
    }
}

// ---------------------------------------------------------------------------
// App harness
// ---------------------------------------------------------------------------

pub fn txt2img_workflow() -> Value {
    json!({
        "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 20}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0]}}
    })
}

pub struct TestApp {
    pub engine: Engine,
    pub dir: TempDir,
    groups_enabled: bool,
}

impl TestApp {
    /// Engine with one online backend `gpu-1` secured by a credential.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::from_parts(
            EngineConfig::rooted_at(dir.path()),
            Arc::new(EventBus::default()),
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryWorkflows::new()),
            Arc::new(BackendRegistry::new(None)),
        );

        let mut config = BackendConfig::new("gpu-1", "10.0.0.5", 8188);
        config.auth_token = Some("secret-token".to_string());
        engine
            .registry
            .register(config, Arc::new(InstantBackend::new("gpu-1")))
            .await
            .unwrap();
        engine
            .registry
            .update_status(
                "gpu-1",
                BackendStatus {
                    online: true,
                    ..Default::default()
                },
            )
            .await;

        Self {
            engine,
            dir,
            groups_enabled: true,
        }
    }

    /// Serve job-group endpoints as if the parallel manager never started.
    pub fn without_groups(mut self) -> Self {
        self.groups_enabled = false;
        self
    }

    pub fn router(&self) -> Router {
        let config = test_config();
        let mut state = AppState::from_engine(
            &self.engine,
            Arc::new(config.clone()),
            Arc::new(WsManager::new()),
        );
        if !self.groups_enabled {
            state.groups = None;
        }
        build_app_router(state, &config)
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::GET, uri, Body::empty()).await
}

pub async fn delete(app: Router, uri: &str) -> Response<Body> {
    send(app, Method::DELETE, uri, Body::empty()).await
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    send(app, Method::POST, uri, Body::from(body.to_string())).await
}

async fn send(app: Router, method: Method, uri: &str, body: Body) -> Response<Body> {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn assert_status(response: &Response<Body>, expected: StatusCode) {
    assert_eq!(response.status(), expected, "unexpected status");
}
