//! The [`BackendClient`] seam and its ComfyUI implementation.
//!
//! Everything above this crate talks to render workers through
//! `Arc<dyn BackendClient>`, so the job managers can be exercised against
//! in-process fakes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use canvasflow_core::backend::BackendConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::ComfyUIClient;
use crate::progress::{ProgressChannel, WsProgressChannel};
use crate::reconnect::{connect_with_retry, ReconnectConfig, RetryError};

/// Subfolder on the worker that receives uploaded inputs.
pub const UPLOAD_SUBFOLDER: &str = "canvasflow";

/// History output keys that list produced files.
const OUTPUT_FILE_KEYS: [&str; 3] = ["images", "gifs", "videos"];

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from talking to a render backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Transport failure: the backend could not be reached.
    #[error("Backend {backend_id} is offline: {message}")]
    Offline { backend_id: String, message: String },

    /// The backend refused the workflow (`node_errors`).
    #[error("Workflow rejected by {backend_id}: {message}")]
    Rejected {
        backend_id: String,
        message: String,
        node_errors: Value,
    },

    /// Non-success HTTP status.
    #[error("Backend {backend_id} API error ({status}): {body}")]
    Api {
        backend_id: String,
        status: u16,
        body: String,
    },

    /// Unexpected response shape.
    #[error("Protocol error from {backend_id}: {message}")]
    Protocol { backend_id: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// True when the failure is a reachability problem worth failing over.
    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline { .. })
    }

    /// Convert a REST-layer error, classifying transport failures and
    /// gateway errors as offline.
    pub fn from_api(backend_id: &str, err: ComfyUIApiError) -> Self {
        let backend_id = backend_id.to_string();
        match err {
            ComfyUIApiError::Request(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                Self::Offline {
                    backend_id,
                    message: e.to_string(),
                }
            }
            ComfyUIApiError::Request(e) => Self::Protocol {
                backend_id,
                message: e.to_string(),
            },
            ComfyUIApiError::ApiError { status, body } if matches!(status, 502..=504) => {
                Self::Offline {
                    backend_id,
                    message: format!("gateway status {status}: {body}"),
                }
            }
            ComfyUIApiError::ApiError { status, body } => Self::Api {
                backend_id,
                status,
                body,
            },
            ComfyUIApiError::Rejected {
                message,
                node_errors,
            } => Self::Rejected {
                backend_id,
                message,
                node_errors,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// A file produced by a prompt, as listed in its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    /// Workflow node that produced the file.
    pub node_id: String,
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// ComfyUI folder type (`output`, `temp`).
    #[serde(rename = "type", default = "default_output_kind")]
    pub kind: String,
}

fn default_output_kind() -> String {
    "output".to_string()
}

/// Memory figures summed across a backend's devices.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemStats {
    pub vram_total: u64,
    pub vram_free: u64,
    pub devices: Vec<String>,
}

/// Extract the produced files of `prompt_id` from a `/history` response.
pub fn parse_history_outputs(history: &Value, prompt_id: &str) -> Vec<OutputFile> {
    let Some(outputs) = history
        .get(prompt_id)
        .and_then(|entry| entry.get("outputs"))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };

    let mut files = Vec::new();
    for (node_id, node_output) in outputs {
        for key in OUTPUT_FILE_KEYS {
            let Some(items) = node_output.get(key).and_then(Value::as_array) else {
                continue;
            };
            for item in items {
                let Some(filename) = item.get("filename").and_then(Value::as_str) else {
                    continue;
                };
                files.push(OutputFile {
                    node_id: node_id.clone(),
                    filename: filename.to_string(),
                    subfolder: item
                        .get("subfolder")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    kind: item
                        .get("type")
                        .and_then(Value::as_str)
                        .map_or_else(default_output_kind, str::to_string),
                });
            }
        }
    }
    files
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Operations the engine needs from a render backend.
#[async_trait]
pub trait BackendClient: Send + Sync {
    fn backend_id(&self) -> &str;

    /// Cheap reachability probe.
    async fn health_check(&self) -> bool {
        self.system_stats().await.is_ok()
    }

    async fn system_stats(&self) -> Result<SystemStats, BackendError>;

    /// Running plus pending prompts.
    async fn queue_depth(&self) -> Result<u32, BackendError>;

    /// Open the event channel. Must happen before [`submit`](Self::submit)
    /// so the prompt is bound to the channel's client id.
    async fn open_progress(&self) -> Result<Box<dyn ProgressChannel>, BackendError>;

    /// Queue `workflow`; returns the worker's prompt id.
    async fn submit(&self, workflow: &Value, client_id: &str) -> Result<String, BackendError>;

    async fn history(&self, prompt_id: &str) -> Result<Value, BackendError>;

    async fn collect_outputs(&self, prompt_id: &str) -> Result<Vec<OutputFile>, BackendError> {
        let history = self.history(prompt_id).await?;
        Ok(parse_history_outputs(&history, prompt_id))
    }

    /// Fetch `file` into `dest_dir`, returning the local path.
    async fn download(&self, file: &OutputFile, dest_dir: &Path) -> Result<PathBuf, BackendError>;

    /// Upload a local input file; returns the reference to place in the
    /// workflow (`subfolder/name`).
    async fn upload_media(&self, path: &Path) -> Result<String, BackendError>;

    async fn interrupt(&self) -> Result<(), BackendError>;

    async fn free(&self) -> Result<(), BackendError>;

    async fn object_info(&self) -> Result<Value, BackendError>;
}

// ---------------------------------------------------------------------------
// ComfyUI implementation
// ---------------------------------------------------------------------------

/// [`BackendClient`] for a ComfyUI server.
pub struct ComfyUIBackend {
    backend_id: String,
    api: ComfyUIApi,
    ws: ComfyUIClient,
    reconnect: ReconnectConfig,
}

impl ComfyUIBackend {
    pub fn new(config: &BackendConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Reuse a shared [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, config: &BackendConfig) -> Self {
        Self {
            backend_id: config.id.clone(),
            api: ComfyUIApi::with_client(client, config.http_url())
                .with_auth_token(config.auth_token.clone()),
            ws: ComfyUIClient::new(config.id.clone(), config.ws_url())
                .with_auth_token(config.auth_token.clone()),
            reconnect: ReconnectConfig::for_dispatch(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn map_err(&self, err: ComfyUIApiError) -> BackendError {
        BackendError::from_api(&self.backend_id, err)
    }
}

#[async_trait]
impl BackendClient for ComfyUIBackend {
    fn backend_id(&self) -> &str {
        &self.backend_id
    }

    async fn system_stats(&self) -> Result<SystemStats, BackendError> {
        let stats = self.api.system_stats().await.map_err(|e| self.map_err(e))?;
        Ok(SystemStats {
            vram_total: stats.devices.iter().map(|d| d.vram_total).sum(),
            vram_free: stats.devices.iter().map(|d| d.vram_free).sum(),
            devices: stats.devices.into_iter().map(|d| d.name).collect(),
        })
    }

    async fn queue_depth(&self) -> Result<u32, BackendError> {
        let queue = self.api.queue().await.map_err(|e| self.map_err(e))?;
        Ok(queue.depth())
    }

    async fn open_progress(&self) -> Result<Box<dyn ProgressChannel>, BackendError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let connection = connect_with_retry(&self.ws, &client_id, &self.reconnect, &cancel)
            .await
            .map_err(|e| match e {
                RetryError::Exhausted { last, .. } => BackendError::Offline {
                    backend_id: self.backend_id.clone(),
                    message: last.to_string(),
                },
                RetryError::Cancelled => BackendError::Offline {
                    backend_id: self.backend_id.clone(),
                    message: "connection attempt cancelled".to_string(),
                },
            })?;
        Ok(Box::new(WsProgressChannel::new(connection)))
    }

    async fn submit(&self, workflow: &Value, client_id: &str) -> Result<String, BackendError> {
        let response = self
            .api
            .submit_workflow(workflow, client_id)
            .await
            .map_err(|e| self.map_err(e))?;
        tracing::info!(
            backend_id = %self.backend_id,
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );
        Ok(response.prompt_id)
    }

    async fn history(&self, prompt_id: &str) -> Result<Value, BackendError> {
        self.api.get_history(prompt_id).await.map_err(|e| self.map_err(e))
    }

    async fn download(&self, file: &OutputFile, dest_dir: &Path) -> Result<PathBuf, BackendError> {
        let bytes = self
            .api
            .view(&file.filename, &file.subfolder, &file.kind)
            .await
            .map_err(|e| self.map_err(e))?;

        let name = Path::new(&file.filename)
            .file_name()
            .ok_or_else(|| BackendError::Protocol {
                backend_id: self.backend_id.clone(),
                message: format!("Invalid output filename \"{}\"", file.filename),
            })?;
        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(name);
        tokio::fs::write(&dest, &bytes).await?;

        tracing::debug!(
            backend_id = %self.backend_id,
            path = %dest.display(),
            bytes = bytes.len(),
            "Downloaded output",
        );
        Ok(dest)
    }

    async fn upload_media(&self, path: &Path) -> Result<String, BackendError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.png")
            .to_string();
        let uploaded = self
            .api
            .upload_image(&file_name, bytes, UPLOAD_SUBFOLDER)
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(uploaded.reference())
    }

    async fn interrupt(&self) -> Result<(), BackendError> {
        self.api.interrupt().await.map_err(|e| self.map_err(e))
    }

    async fn free(&self) -> Result<(), BackendError> {
        self.api.free().await.map_err(|e| self.map_err(e))
    }

    async fn object_info(&self) -> Result<Value, BackendError> {
        self.api.object_info(None).await.map_err(|e| self.map_err(e))
    }
}
