//! Shared harness for engine integration tests: a scripted in-memory render
//! backend and an [`Engine`] wired over temporary directories.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canvasflow_comfyui::{
    BackendClient, BackendError, OutputFile, ProgressChannel, ProgressUpdate, SystemStats,
};
use canvasflow_core::backend::{BackendConfig, BackendStatus};
use canvasflow_core::workflow::WorkflowTemplate;
use canvasflow_events::EventBus;
use canvasflow_pipeline::config::EngineConfig;
use canvasflow_pipeline::workflows::MemoryWorkflows;
use canvasflow_pipeline::{BackendRegistry, Engine, MemoryJobStore};
use serde_json::{json, Value};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// How a [`FakeBackend`] answers a submitted prompt.
#[derive(Debug, Clone)]
pub enum Behaviour {
    /// Report progress, complete and produce `files`.
    Succeed { files: Vec<String> },
    /// Unreachable: every call fails with an offline error.
    Offline,
    /// Accept the prompt, then report an execution error.
    ExecutionError,
    /// Accept the prompt and never finish.
    Hang,
    /// Reachable, but every prompt submission is refused at the transport.
    SubmitFails,
}

pub struct FakeBackend {
    id: String,
    behaviour: Behaviour,
    submitted: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<PathBuf>>,
    interrupts: AtomicUsize,
}

impl FakeBackend {
    pub fn new(id: &str, behaviour: Behaviour) -> Self {
        Self {
            id: id.to_string(),
            behaviour,
            submitted: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(id: &str, files: &[&str]) -> Self {
        Self::new(
            id,
            Behaviour::Succeed {
                files: files.iter().map(|f| f.to_string()).collect(),
            },
        )
    }

    pub fn submitted(&self) -> Vec<Value> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<PathBuf> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }

    fn offline(&self) -> BackendError {
        BackendError::Offline {
            backend_id: self.id.clone(),
            message: "connection refused".to_string(),
        }
    }

    fn check_online(&self) -> Result<(), BackendError> {
        match self.behaviour {
            Behaviour::Offline => Err(self.offline()),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl BackendClient for FakeBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    async fn system_stats(&self) -> Result<SystemStats, BackendError> {
        self.check_online()?;
        Ok(SystemStats {
            vram_total: 24 << 30,
            vram_free: 20 << 30,
            devices: vec!["cuda:0".to_string()],
        })
    }

    async fn queue_depth(&self) -> Result<u32, BackendError> {
        self.check_online()?;
        Ok(0)
    }

    async fn open_progress(&self) -> Result<Box<dyn ProgressChannel>, BackendError> {
        self.check_online()?;
        let script = match &self.behaviour {
            Behaviour::Succeed { .. } => Some(VecDeque::from([
                ProgressUpdate::Started,
                ProgressUpdate::Executing { node: "3".into() },
                ProgressUpdate::Progress {
                    value: 10,
                    max: 20,
                    node: Some("3".into()),
                },
                ProgressUpdate::Completed,
            ])),
            Behaviour::ExecutionError => Some(VecDeque::from([
                ProgressUpdate::Started,
                ProgressUpdate::Error {
                    node_id: "3".into(),
                    node_type: Some("KSampler".into()),
                    message: "CUDA out of memory".into(),
                    exception_type: "torch.OutOfMemoryError".into(),
                    traceback: vec!["Traceback (most recent call last):\n".into()],
                },
            ])),
            Behaviour::Hang | Behaviour::SubmitFails => None,
            Behaviour::Offline => unreachable!(),
        };
        Ok(Box::new(ScriptedProgress {
            client_id: format!("{}-client", self.id),
            script,
        }))
    }

    async fn submit(&self, workflow: &Value, _client_id: &str) -> Result<String, BackendError> {
        self.check_online()?;
        if matches!(self.behaviour, Behaviour::SubmitFails) {
            return Err(self.offline());
        }
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(workflow.clone());
        Ok(format!("{}-prompt-{}", self.id, submitted.len()))
    }

    async fn history(&self, _prompt_id: &str) -> Result<Value, BackendError> {
        self.check_online()?;
        Ok(json!({}))
    }

    async fn collect_outputs(&self, _prompt_id: &str) -> Result<Vec<OutputFile>, BackendError> {
        self.check_online()?;
        let files = match &self.behaviour {
            Behaviour::Succeed { files } => files.clone(),
            _ => Vec::new(),
        };
        Ok(files
            .into_iter()
            .map(|filename| OutputFile {
                node_id: "9".to_string(),
                filename,
                subfolder: String::new(),
                kind: "output".to_string(),
            })
            .collect())
    }

    async fn download(&self, file: &OutputFile, dest_dir: &Path) -> Result<PathBuf, BackendError> {
        self.check_online()?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let path = dest_dir.join(&file.filename);
        tokio::fs::write(&path, format!("{} from {}", file.filename, self.id)).await?;
        Ok(path)
    }

    async fn upload_media(&self, path: &Path) -> Result<String, BackendError> {
        self.check_online()?;
        self.uploads.lock().unwrap().push(path.to_path_buf());
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("upload");
        Ok(format!("canvasflow/{name}"))
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn free(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn object_info(&self) -> Result<Value, BackendError> {
        self.check_online()?;
        Ok(json!({}))
    }
}

/// Plays back a fixed list of updates; `None` never yields anything.
struct ScriptedProgress {
    client_id: String,
    script: Option<VecDeque<ProgressUpdate>>,
}

#[async_trait]
impl ProgressChannel for ScriptedProgress {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn next_update(
        &mut self,
        _prompt_id: &str,
    ) -> Result<Option<ProgressUpdate>, BackendError> {
        match &mut self.script {
            Some(script) => Ok(script.pop_front()),
            None => std::future::pending().await,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine harness
// ---------------------------------------------------------------------------

/// Image-to-image workflow in API format.
pub fn img2img_workflow() -> Value {
    json!({
        "1": {"class_type": "LoadImage", "inputs": {"image": "placeholder.png"}},
        "3": {"class_type": "KSampler", "inputs": {"seed": 1, "steps": 20, "model": ["4", 0]}},
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "sdxl.safetensors"}},
        "9": {"class_type": "SaveImage", "inputs": {"images": ["3", 0], "filename_prefix": "canvas"}}
    })
}

pub struct Harness {
    pub engine: Engine,
    pub workflows: Arc<MemoryWorkflows>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Harness whose engine configuration is adjusted by `tweak`.
    pub async fn with_config(tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::rooted_at(dir.path());
        tweak(&mut config);
        let workflows = Arc::new(MemoryWorkflows::new());
        workflows
            .insert(WorkflowTemplate::from_value("img2img", img2img_workflow()).unwrap())
            .await;

        let engine = Engine::from_parts(
            config,
            Arc::new(EventBus::default()),
            Arc::new(MemoryJobStore::new()),
            workflows.clone(),
            Arc::new(BackendRegistry::new(None)),
        );
        Self {
            engine,
            workflows,
            dir,
        }
    }

    /// Register `backend` and mark it online without a health poll.
    pub async fn add_backend(&self, backend: FakeBackend) -> Arc<FakeBackend> {
        let backend = Arc::new(backend);
        let id = backend.backend_id().to_string();
        self.engine
            .registry
            .register(BackendConfig::new(id.as_str(), "127.0.0.1", 8188), backend.clone())
            .await
            .unwrap();
        self.engine
            .registry
            .update_status(
                &id,
                BackendStatus {
                    online: true,
                    ..Default::default()
                },
            )
            .await;
        backend
    }

    /// Write an input file into the harness directory.
    pub fn input_file(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join("inputs").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"input bytes").unwrap();
        path
    }

    pub fn output_dir(&self) -> &Path {
        &self.engine.config.output_dir
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
