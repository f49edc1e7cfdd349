//! Dispatch of one Workflow node to a render backend.
//!
//! Steps: resolve the template, merge parameters (job globals < upstream
//! inputs < node overrides), prepare and upload media, patch the workflow,
//! open the progress channel, submit, follow progress to a terminal update
//! and download the produced files to `<output_root>/<job_id>/`.
//!
//! A transport failure ([`PipelineError::BackendOffline`]) is retried once on
//! an alternative backend. Every other failure is returned as is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use canvasflow_comfyui::{BackendClient, ProgressChannel, ProgressUpdate};
use canvasflow_core::canvas::{CanvasNode, DEFAULT_OUTPUT_PORT};
use canvasflow_core::job::PortMap;
use canvasflow_core::types::BackendId;
use canvasflow_core::workflow::{patch_parameters, WidgetSchema, WorkflowTemplate};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::media::{self, PreparedUpload};
use crate::registry::{BackendRegistry, SelectedBackend};
use crate::workflows::{resolve_template, WorkflowSource};

/// One initial attempt plus one failover retry.
const MAX_ATTEMPTS: u32 = 2;

/// Per-job directory holding prepared uploads.
const STAGING_DIR: &str = ".staging";

/// Chooses a replacement backend when dispatch cannot proceed on the
/// scheduler's pick, e.g. by asking an operator.
#[async_trait]
pub trait FailoverHandler: Send + Sync {
    /// `failed` is the backend that just went offline, or `None` when no
    /// backend could be resolved in the first place.
    async fn select_alternative(
        &self,
        node_id: &str,
        failed: Option<&str>,
        available: &[BackendId],
    ) -> Option<BackendId>;
}

/// Progress reported while a node is being dispatched.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    Attempt { backend_id: BackendId, attempt: u32 },
    Submitted { prompt_id: String },
    Progress { percent: u8, step: Option<String> },
    Failover { from: BackendId, to: BackendId, reason: String },
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub job_id: Uuid,
    pub node: CanvasNode,
    pub parameters: Map<String, Value>,
    pub inputs: PortMap,
    pub target_backend: Option<BackendId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub backend_id: BackendId,
    pub prompt_id: String,
    pub files: Vec<PathBuf>,
    pub elapsed_secs: f64,
    pub attempts: u32,
}

impl DispatchOutcome {
    /// Output ports of the Workflow node: `output` carries the full result,
    /// `images` the file list alone.
    pub fn to_ports(&self) -> PortMap {
        let images: Vec<Value> = self
            .files
            .iter()
            .map(|p| Value::String(p.to_string_lossy().into_owned()))
            .collect();
        let mut ports = PortMap::new();
        ports.insert(
            DEFAULT_OUTPUT_PORT.to_string(),
            json!({
                "images": images,
                "prompt_id": self.prompt_id,
                "backend_id": self.backend_id,
                "elapsed_secs": self.elapsed_secs,
            }),
        );
        ports.insert("images".to_string(), Value::Array(images));
        ports
    }
}

/// Parameter precedence: job globals < upstream inputs < node overrides.
pub fn merge_parameters(
    globals: &Map<String, Value>,
    inputs: &PortMap,
    overrides: &Map<String, Value>,
) -> Map<String, Value> {
    let mut merged = globals.clone();
    merged.extend(inputs.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

fn required_capabilities(node: &CanvasNode) -> Vec<String> {
    node.config
        .get("capabilities")
        .and_then(Value::as_array)
        .map(|caps| {
            caps.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub struct WorkflowDispatcher {
    registry: Arc<BackendRegistry>,
    workflows: Arc<dyn WorkflowSource>,
    output_root: PathBuf,
    node_timeout: Duration,
    failover: RwLock<Option<Arc<dyn FailoverHandler>>>,
    schemas: RwLock<HashMap<BackendId, Arc<WidgetSchema>>>,
}

impl WorkflowDispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        workflows: Arc<dyn WorkflowSource>,
        output_root: impl Into<PathBuf>,
        node_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            workflows,
            output_root: output_root.into(),
            node_timeout,
            failover: RwLock::new(None),
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Install or clear the failover handler.
    pub async fn set_failover_handler(&self, handler: Option<Arc<dyn FailoverHandler>>) {
        *self.failover.write().await = handler;
    }

    async fn failover_handler(&self) -> Option<Arc<dyn FailoverHandler>> {
        self.failover.read().await.clone()
    }

    /// Run one Workflow node to completion.
    pub async fn dispatch(
        &self,
        req: &DispatchRequest,
        cancel: &CancellationToken,
        notify: &(dyn Fn(DispatchEvent) + Send + Sync),
    ) -> Result<DispatchOutcome, PipelineError> {
        let template = resolve_template(self.workflows.as_ref(), &req.node).await?;
        let mut params = merge_parameters(&req.parameters, &req.inputs, &req.node.parameters);
        let staging = self
            .output_root
            .join(req.job_id.to_string())
            .join(STAGING_DIR)
            .join(&req.node.id);
        let uploads = media::prepare_uploads(&mut params, &req.node.config, &staging).await?;

        let started = Instant::now();
        let mut backend = self.resolve_backend(req).await?;
        let mut attempt = 1;
        loop {
            notify(DispatchEvent::Attempt {
                backend_id: backend.backend_id.clone(),
                attempt,
            });
            tracing::info!(
                job_id = %req.job_id,
                node_id = %req.node.id,
                backend_id = %backend.backend_id,
                attempt,
                "Dispatching workflow node",
            );

            let result = self
                .run_guarded(&backend, req, &template, &params, &uploads, cancel, notify)
                .await;
            match result {
                Ok((prompt_id, files)) => {
                    return Ok(DispatchOutcome {
                        backend_id: backend.backend_id,
                        prompt_id,
                        files,
                        elapsed_secs: started.elapsed().as_secs_f64(),
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_backend_offline() && attempt < MAX_ATTEMPTS => {
                    let Some(next) = self.alternative(req, &backend.backend_id).await else {
                        return Err(e);
                    };
                    tracing::warn!(
                        job_id = %req.job_id,
                        node_id = %req.node.id,
                        from = %backend.backend_id,
                        to = %next.backend_id,
                        error = %e,
                        "Backend offline, failing over",
                    );
                    notify(DispatchEvent::Failover {
                        from: backend.backend_id.clone(),
                        to: next.backend_id.clone(),
                        reason: e.to_string(),
                    });
                    backend = next;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Node affinity, then the job target, then the scheduler, then the
    /// failover handler.
    async fn resolve_backend(&self, req: &DispatchRequest) -> Result<SelectedBackend, PipelineError> {
        for (source, wanted) in [
            ("node affinity", req.node.preferred_backend.as_deref()),
            ("job target", req.target_backend.as_deref()),
        ] {
            let Some(id) = wanted else { continue };
            if let Some(found) = self.registry.available(id).await {
                return Ok(found);
            }
            tracing::warn!(node_id = %req.node.id, backend_id = id, source, "Requested backend unavailable");
        }

        let caps = required_capabilities(&req.node);
        if let Some(found) = self.registry.select_backend(None, &caps, &[]).await {
            return Ok(found);
        }

        if let Some(handler) = self.failover_handler().await {
            let available = self.registry.ids().await;
            if let Some(id) = handler.select_alternative(&req.node.id, None, &available).await {
                if let Some(client) = self.registry.client(&id).await {
                    return Ok(SelectedBackend {
                        backend_id: id,
                        client,
                    });
                }
            }
        }

        Err(PipelineError::NoBackendAvailable(format!(
            "no backend can run node \"{}\"",
            req.node.id
        )))
    }

    async fn alternative(&self, req: &DispatchRequest, failed: &str) -> Option<SelectedBackend> {
        let exclude = vec![failed.to_string()];
        if let Some(handler) = self.failover_handler().await {
            let available = self.registry.available_ids(&exclude).await;
            if let Some(id) = handler
                .select_alternative(&req.node.id, Some(failed), &available)
                .await
                .filter(|id| id != failed)
            {
                if let Some(client) = self.registry.client(&id).await {
                    return Some(SelectedBackend {
                        backend_id: id,
                        client,
                    });
                }
            }
        }
        let caps = required_capabilities(&req.node);
        self.registry.select_backend(None, &caps, &exclude).await
    }

    /// Run on one backend under the node timeout and the cancel token. A
    /// submitted prompt is interrupted on timeout or cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn run_guarded(
        &self,
        backend: &SelectedBackend,
        req: &DispatchRequest,
        template: &WorkflowTemplate,
        params: &Map<String, Value>,
        uploads: &[PreparedUpload],
        cancel: &CancellationToken,
        notify: &(dyn Fn(DispatchEvent) + Send + Sync),
    ) -> Result<(String, Vec<PathBuf>), PipelineError> {
        let submitted = OnceLock::new();
        let work = self.run_on(backend, req, template, params, uploads, &submitted, notify);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(self.node_timeout, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(self.node_timeout.as_secs())),
            },
        };

        if matches!(result, Err(PipelineError::Cancelled | PipelineError::Timeout(_))) {
            if let Some(prompt_id) = submitted.get() {
                tracing::info!(
                    node_id = %req.node.id,
                    backend_id = %backend.backend_id,
                    prompt_id = %prompt_id,
                    "Interrupting backend",
                );
                if let Err(e) = backend.client.interrupt().await {
                    tracing::warn!(backend_id = %backend.backend_id, error = %e, "Interrupt failed");
                }
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_on(
        &self,
        backend: &SelectedBackend,
        req: &DispatchRequest,
        template: &WorkflowTemplate,
        params: &Map<String, Value>,
        uploads: &[PreparedUpload],
        submitted: &OnceLock<String>,
        notify: &(dyn Fn(DispatchEvent) + Send + Sync),
    ) -> Result<(String, Vec<PathBuf>), PipelineError> {
        let client = backend.client.as_ref();

        let mut params = params.clone();
        for upload in uploads {
            let reference = client.upload_media(&upload.path).await?;
            tracing::debug!(param = %upload.param, reference = %reference, "Uploaded media");
            params.insert(upload.param.clone(), Value::String(reference));
        }

        let schema = self.schema_for(client).await;
        let mut workflow = template.workflow.clone();
        let report = patch_parameters(&mut workflow, &params, &template.bindings, schema.as_deref())?;
        if !report.unmatched.is_empty() {
            tracing::debug!(
                node_id = %req.node.id,
                unmatched = ?report.unmatched,
                "Parameters matched no workflow input",
            );
        }

        let mut progress = client.open_progress().await?;
        let prompt_id = client.submit(&workflow, progress.client_id()).await?;
        let _ = submitted.set(prompt_id.clone());
        notify(DispatchEvent::Submitted {
            prompt_id: prompt_id.clone(),
        });

        self.follow_progress(progress.as_mut(), backend, req, &workflow, &prompt_id, notify)
            .await?;

        let files = client.collect_outputs(&prompt_id).await?;
        let dest = self.output_root.join(req.job_id.to_string());
        let mut paths = Vec::with_capacity(files.len());
        for file in &files {
            paths.push(client.download(file, &dest).await?);
        }
        tracing::info!(
            node_id = %req.node.id,
            backend_id = %backend.backend_id,
            prompt_id = %prompt_id,
            files = paths.len(),
            "Workflow node finished",
        );
        Ok((prompt_id, paths))
    }

    async fn follow_progress(
        &self,
        progress: &mut dyn ProgressChannel,
        backend: &SelectedBackend,
        req: &DispatchRequest,
        workflow: &Value,
        prompt_id: &str,
        notify: &(dyn Fn(DispatchEvent) + Send + Sync),
    ) -> Result<(), PipelineError> {
        let mut percent = 0u8;
        loop {
            let Some(update) = progress.next_update(prompt_id).await? else {
                return Err(PipelineError::BackendOffline {
                    backend_id: backend.backend_id.clone(),
                    message: "progress stream closed before completion".to_string(),
                });
            };
            match update {
                ProgressUpdate::Started | ProgressUpdate::Cached { .. } => {}
                ProgressUpdate::Executing { node } => {
                    notify(DispatchEvent::Progress {
                        percent,
                        step: Some(step_label(workflow, &node)),
                    });
                }
                ProgressUpdate::Progress { .. } => {
                    if let Some(p) = update.percent() {
                        percent = p;
                        notify(DispatchEvent::Progress { percent, step: None });
                    }
                }
                ProgressUpdate::Completed => return Ok(()),
                ProgressUpdate::Error {
                    node_id,
                    node_type,
                    message,
                    exception_type,
                    traceback,
                } => {
                    return Err(PipelineError::Execution {
                        node_id: req.node.id.clone(),
                        message: format!(
                            "{exception_type}: {message} (worker node {node_id}{})",
                            node_type.map(|t| format!(" {t}")).unwrap_or_default()
                        ),
                        traceback: (!traceback.is_empty()).then(|| traceback.join("")),
                    });
                }
                ProgressUpdate::Interrupted => {
                    return Err(PipelineError::Execution {
                        node_id: req.node.id.clone(),
                        message: "execution interrupted on the backend".to_string(),
                        traceback: None,
                    });
                }
            }
        }
    }

    async fn schema_for(&self, client: &dyn BackendClient) -> Option<Arc<WidgetSchema>> {
        let backend_id = client.backend_id();
        if let Some(schema) = self.schemas.read().await.get(backend_id) {
            return Some(Arc::clone(schema));
        }
        match client.object_info().await {
            Ok(info) => {
                let schema = Arc::new(WidgetSchema::from_object_info(&info));
                self.schemas
                    .write()
                    .await
                    .insert(backend_id.to_string(), Arc::clone(&schema));
                Some(schema)
            }
            Err(e) => {
                tracing::debug!(backend_id, error = %e, "object_info unavailable");
                None
            }
        }
    }
}

/// `"KSampler (3)"` for workflow node `3`, or the bare id.
fn step_label(workflow: &Value, node: &str) -> String {
    match workflow
        .get(node)
        .and_then(|n| n.get("class_type"))
        .and_then(Value::as_str)
    {
        Some(class) => format!("{class} ({node})"),
        None => node.to_string(),
    }
}
