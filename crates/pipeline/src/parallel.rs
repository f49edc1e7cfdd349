//! Parallel seed variation: one workflow replicated across backends.
//!
//! A [`JobGroup`] holds one [`ChildJob`] per backend, each with its own seed.
//! Every child runs as an independent task, so an error, a timeout or a
//! cancellation only ever settles that child. The group status is derived
//! from the children on read.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use canvasflow_comfyui::{BackendClient, ProgressUpdate};
use canvasflow_core::error::CoreError;
use canvasflow_core::job_events;
use canvasflow_core::job_group::{
    ChildJob, ChildJobStatus, GroupCounts, GroupStatus, JobGroup, DEFAULT_CHILD_TIMEOUT_SECS,
};
use canvasflow_core::seeds::{generate_seeds, SeedStrategy};
use canvasflow_core::types::{BackendId, Timestamp};
use canvasflow_core::workflow::{patch_parameters, patch_seed, validate_api_workflow};
use canvasflow_events::{EventBus, PlatformEvent, SinkRegistry};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::janitor::cutoff;
use crate::registry::BackendRegistry;
use crate::store::JobStore;

/// Random base seeds are drawn below this bound.
const RANDOM_BASE_LIMIT: u64 = 1 << 32;

// ---------------------------------------------------------------------------
// Requests and views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct JobGroupRequest {
    /// ComfyUI API-format workflow.
    pub workflow: Value,
    pub backend_ids: Vec<BackendId>,
    #[serde(default)]
    pub seed_strategy: SeedStrategy,
    pub base_seed: Option<u64>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timeout_secs: Option<u64>,
}

/// Full status of a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    pub group_id: Uuid,
    pub status: GroupStatus,
    pub seed_strategy: SeedStrategy,
    pub base_seed: u64,
    pub children: Vec<ChildJob>,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub counts: GroupCounts,
    pub metadata: Map<String, Value>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl From<&JobGroup> for GroupView {
    fn from(group: &JobGroup) -> Self {
        let counts = group.counts();
        Self {
            group_id: group.id,
            status: group.status(),
            seed_strategy: group.seed_strategy,
            base_seed: group.base_seed,
            children: group.children.clone(),
            completed: counts.completed,
            failed: counts.failed + counts.timeout,
            total: counts.total,
            counts,
            metadata: group.metadata.clone(),
            created_at: group.created_at,
            completed_at: group.completed_at,
        }
    }
}

/// One row of the group listing.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group_id: Uuid,
    pub status: GroupStatus,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub created_at: Timestamp,
}

impl From<&JobGroup> for GroupSummary {
    fn from(group: &JobGroup) -> Self {
        let counts = group.counts();
        Self {
            group_id: group.id,
            status: group.status(),
            total: counts.total,
            completed: counts.completed,
            failed: counts.failed + counts.timeout,
            created_at: group.created_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelGroupResponse {
    pub group_id: Uuid,
    /// Children that were queued or running when the cancel arrived.
    pub interrupted: usize,
    pub already_complete: usize,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct GroupHandle {
    group: RwLock<JobGroup>,
    cancel: CancellationToken,
}

pub struct ParallelJobManager {
    registry: Arc<BackendRegistry>,
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    sinks: Arc<SinkRegistry>,
    output_root: PathBuf,
    groups: RwLock<HashMap<Uuid, Arc<GroupHandle>>>,
}

impl ParallelJobManager {
    pub fn new(
        registry: Arc<BackendRegistry>,
        store: Arc<dyn JobStore>,
        bus: Arc<EventBus>,
        sinks: Arc<SinkRegistry>,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            bus,
            sinks,
            output_root: output_root.into(),
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn sinks(&self) -> &Arc<SinkRegistry> {
        &self.sinks
    }

    /// Validate the request, create the group and start every child.
    pub async fn submit_group(
        self: &Arc<Self>,
        request: JobGroupRequest,
    ) -> Result<JobGroup, PipelineError> {
        validate_api_workflow(&request.workflow)?;

        let mut backends: Vec<BackendId> = Vec::new();
        for id in request.backend_ids {
            if backends.contains(&id) {
                continue;
            }
            if self.registry.is_enabled(&id).await {
                backends.push(id);
            } else {
                tracing::warn!(backend_id = %id, "Dropping unknown or disabled backend from job group");
            }
        }
        if backends.is_empty() {
            return Err(PipelineError::NoBackendAvailable(
                "none of the requested backends is registered and enabled".to_string(),
            ));
        }

        let base_seed = request
            .base_seed
            .unwrap_or_else(|| rand::rng().random_range(0..RANDOM_BASE_LIMIT));
        let seeds = generate_seeds(request.seed_strategy, base_seed, backends.len());
        let children = backends
            .into_iter()
            .zip(seeds)
            .map(|(backend_id, seed)| ChildJob::new(backend_id, seed))
            .collect();

        let group = JobGroup {
            id: Uuid::new_v4(),
            workflow: request.workflow,
            seed_strategy: request.seed_strategy,
            base_seed,
            parameters: request.parameters,
            metadata: request.metadata,
            timeout_secs: request
                .timeout_secs
                .filter(|t| *t > 0)
                .unwrap_or(DEFAULT_CHILD_TIMEOUT_SECS),
            children,
            cancelled: false,
            created_at: chrono::Utc::now(),
            completed_at: None,
        };
        self.store.save_group(&group).await?;

        let handle = Arc::new(GroupHandle {
            group: RwLock::new(group.clone()),
            cancel: CancellationToken::new(),
        });
        self.groups.write().await.insert(group.id, Arc::clone(&handle));

        tracing::info!(
            group_id = %group.id,
            children = group.children.len(),
            strategy = %group.seed_strategy,
            base_seed,
            "Job group created",
        );
        self.emit(
            group.id,
            job_events::GROUP_CREATED,
            json!({
                "children": group.children.iter().map(|c| json!({
                    "child_id": c.id, "backend_id": c.backend_id, "seed": c.seed,
                })).collect::<Vec<_>>(),
            }),
        )
        .await;

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run_group(handle).await });
        Ok(group)
    }

    pub async fn get_group(&self, group_id: Uuid) -> Result<JobGroup, PipelineError> {
        if let Some(handle) = self.groups.read().await.get(&group_id) {
            return Ok(handle.group.read().await.clone());
        }
        self.store.load_group(group_id).await?.ok_or_else(|| {
            CoreError::NotFound {
                entity: "JobGroup",
                id: group_id.to_string(),
            }
            .into()
        })
    }

    /// Every group, newest first.
    pub async fn list_groups(&self) -> Result<Vec<JobGroup>, PipelineError> {
        let mut groups = self.store.list_groups().await?;
        let live = self.groups.read().await;
        for group in &mut groups {
            if let Some(handle) = live.get(&group.id) {
                *group = handle.group.read().await.clone();
            }
        }
        Ok(groups)
    }

    /// Cancel a group: queued and running children are interrupted and
    /// settle as Cancelled, terminal ones are left alone. A finished group
    /// keeps its status.
    pub async fn cancel_group(&self, group_id: Uuid) -> Result<CancelGroupResponse, PipelineError> {
        let handle = self.groups.read().await.get(&group_id).cloned();
        let Some(handle) = handle else {
            // Finished before this process started: nothing left to stop.
            let group = self.get_group(group_id).await?;
            return Ok(CancelGroupResponse {
                group_id,
                interrupted: 0,
                already_complete: group.children.len(),
            });
        };

        let (snapshot, running_backends, interrupted, already_complete) = {
            let mut group = handle.group.write().await;
            let finished = group.completed_at.is_some()
                || group.children.iter().all(|c| c.status.is_terminal());
            if finished {
                return Ok(CancelGroupResponse {
                    group_id,
                    interrupted: 0,
                    already_complete: group.children.len(),
                });
            }
            group.cancelled = true;
            let mut running_backends: Vec<BackendId> = Vec::new();
            let mut interrupted = 0;
            let mut already_complete = 0;
            for child in &group.children {
                if child.status.is_terminal() {
                    already_complete += 1;
                } else {
                    interrupted += 1;
                    if child.status == ChildJobStatus::Running
                        && !running_backends.contains(&child.backend_id)
                    {
                        running_backends.push(child.backend_id.clone());
                    }
                }
            }
            (group.clone(), running_backends, interrupted, already_complete)
        };

        for backend_id in &running_backends {
            if let Some(client) = self.registry.client(backend_id).await {
                if let Err(e) = client.interrupt().await {
                    tracing::warn!(backend_id = %backend_id, error = %e, "Interrupt failed");
                }
            }
        }
        handle.cancel.cancel();

        tracing::info!(group_id = %group_id, interrupted, already_complete, "Job group cancelled");
        self.persist(&snapshot).await;
        self.emit(
            group_id,
            job_events::GROUP_CANCELLED,
            json!({"interrupted": interrupted, "already_complete": already_complete}),
        )
        .await;

        Ok(CancelGroupResponse {
            group_id,
            interrupted,
            already_complete,
        })
    }

    /// Drop live handles of groups that finished more than `retention` ago.
    /// They stay readable from the store. Returns how many were dropped.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let cutoff = cutoff(retention);
        let mut groups = self.groups.write().await;
        let mut expired = Vec::new();
        for (id, handle) in groups.iter() {
            let group = handle.group.read().await;
            if group.completed_at.is_some_and(|at| at <= cutoff) {
                expired.push(*id);
            }
        }
        for id in &expired {
            groups.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(evicted = expired.len(), "Evicted finished job groups from memory");
        }
        expired.len()
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn run_group(self: Arc<Self>, handle: Arc<GroupHandle>) {
        let (group_id, child_ids) = {
            let group = handle.group.read().await;
            (group.id, group.children.iter().map(|c| c.id).collect::<Vec<_>>())
        };

        let tasks: Vec<_> = child_ids
            .into_iter()
            .map(|child_id| {
                let manager = Arc::clone(&self);
                let handle = Arc::clone(&handle);
                tokio::spawn(async move { manager.run_child(&handle, child_id).await })
            })
            .collect();
        for joined in futures::future::join_all(tasks).await {
            if let Err(e) = joined {
                tracing::error!(group_id = %group_id, error = %e, "Child task aborted");
            }
        }

        let group = {
            let mut group = handle.group.write().await;
            group.completed_at = Some(chrono::Utc::now());
            group.clone()
        };
        self.persist(&group).await;
        let counts = group.counts();
        tracing::info!(group_id = %group_id, status = ?group.status(), "Job group finished");
        self.emit(
            group_id,
            job_events::GROUP_COMPLETED,
            json!({"status": group.status(), "counts": counts}),
        )
        .await;
        self.sinks.close_scope(&group_id.to_string()).await;
    }

    async fn run_child(&self, handle: &GroupHandle, child_id: Uuid) {
        let (group_id, child, workflow, parameters, timeout) = {
            let group = handle.group.read().await;
            let Some(child) = group.child(child_id).cloned() else {
                return;
            };
            (
                group.id,
                child,
                group.workflow.clone(),
                group.parameters.clone(),
                Duration::from_secs(group.timeout_secs),
            )
        };

        if handle.cancel.is_cancelled() {
            self.settle_child(handle, child_id, Err(PipelineError::Cancelled)).await;
            return;
        }
        self.update_child(handle, child_id, true, |c| c.transition(ChildJobStatus::Running))
            .await;
        self.emit(
            group_id,
            job_events::CHILD_STARTED,
            json!({"child_id": child_id, "backend_id": child.backend_id, "seed": child.seed}),
        )
        .await;

        let Some(client) = self.registry.client(&child.backend_id).await else {
            let err = PipelineError::NoBackendAvailable(format!(
                "backend {} is no longer registered",
                child.backend_id
            ));
            self.settle_child(handle, child_id, Err(err)).await;
            return;
        };

        // The child's seed wins over a shared `seed` parameter.
        let mut workflow = workflow;
        if !parameters.is_empty() {
            if let Err(e) = patch_parameters(&mut workflow, &parameters, &[], None) {
                self.settle_child(handle, child_id, Err(e.into())).await;
                return;
            }
        }
        let patched = patch_seed(&mut workflow, child.seed);
        if patched == 0 {
            tracing::debug!(group_id = %group_id, child_id = %child_id, "Workflow has no sampler seed to vary");
        }

        let submitted = OnceLock::new();
        let work = self.execute_child(handle, group_id, child_id, client.as_ref(), &workflow, &submitted);
        let result = tokio::select! {
            biased;
            _ = handle.cancel.cancelled() => Err(PipelineError::Cancelled),
            outcome = tokio::time::timeout(timeout, work) => match outcome {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout(timeout.as_secs())),
            },
        };

        if matches!(result, Err(PipelineError::Timeout(_))) && submitted.get().is_some() {
            if let Err(e) = client.interrupt().await {
                tracing::warn!(backend_id = %child.backend_id, error = %e, "Interrupt after timeout failed");
            }
        }
        self.settle_child(handle, child_id, result).await;
    }

    async fn execute_child(
        &self,
        handle: &GroupHandle,
        group_id: Uuid,
        child_id: Uuid,
        client: &dyn BackendClient,
        workflow: &Value,
        submitted: &OnceLock<String>,
    ) -> Result<Vec<String>, PipelineError> {
        let mut progress = client.open_progress().await?;
        let prompt_id = client.submit(workflow, progress.client_id()).await?;
        let _ = submitted.set(prompt_id.clone());
        self.update_child(handle, child_id, true, |c| {
            c.prompt_id = Some(prompt_id.clone());
            Ok(())
        })
        .await;

        loop {
            let Some(update) = progress.next_update(&prompt_id).await? else {
                return Err(PipelineError::BackendOffline {
                    backend_id: client.backend_id().to_string(),
                    message: "progress stream closed before completion".to_string(),
                });
            };
            match update {
                ProgressUpdate::Completed => break,
                ProgressUpdate::Error {
                    node_id,
                    message,
                    exception_type,
                    traceback,
                    ..
                } => {
                    return Err(PipelineError::Execution {
                        node_id,
                        message: format!("{exception_type}: {message}"),
                        traceback: (!traceback.is_empty()).then(|| traceback.join("")),
                    });
                }
                ProgressUpdate::Interrupted => {
                    return Err(PipelineError::Execution {
                        node_id: String::new(),
                        message: "execution interrupted on the backend".to_string(),
                        traceback: None,
                    });
                }
                other => {
                    if let Some(percent) = other.percent() {
                        self.update_child(handle, child_id, false, |c| {
                            c.progress = percent;
                            Ok(())
                        })
                        .await;
                        self.emit(
                            group_id,
                            job_events::CHILD_PROGRESS,
                            json!({"child_id": child_id, "progress": percent}),
                        )
                        .await;
                    }
                }
            }
        }

        let files = client.collect_outputs(&prompt_id).await?;
        let dest = self
            .output_root
            .join("groups")
            .join(group_id.to_string())
            .join(child_id.to_string());
        let mut outputs = Vec::with_capacity(files.len());
        for file in &files {
            let path = client.download(file, &dest).await?;
            outputs.push(path.to_string_lossy().into_owned());
        }
        Ok(outputs)
    }

    /// Record the terminal state of a child and announce it.
    async fn settle_child(
        &self,
        handle: &GroupHandle,
        child_id: Uuid,
        result: Result<Vec<String>, PipelineError>,
    ) {
        let group_id = handle.group.read().await.id;
        let (status, event_type, error) = match &result {
            Ok(_) => (ChildJobStatus::Completed, job_events::CHILD_COMPLETED, None),
            Err(PipelineError::Timeout(_)) => (
                ChildJobStatus::Timeout,
                job_events::CHILD_TIMEOUT,
                result.as_ref().err().map(ToString::to_string),
            ),
            Err(PipelineError::Cancelled) => (
                ChildJobStatus::Cancelled,
                job_events::CHILD_CANCELLED,
                Some(canvasflow_core::job::CANCELLED_BY_USER.to_string()),
            ),
            Err(e) => (ChildJobStatus::Failed, job_events::CHILD_FAILED, Some(e.to_string())),
        };
        let outputs = result.unwrap_or_default();

        let settled = self
            .update_child(handle, child_id, true, |c| {
                c.transition(status)?;
                c.outputs = outputs.clone();
                c.error = error.clone();
                Ok(())
            })
            .await;
        let Some(child) = settled else {
            return;
        };

        match status {
            ChildJobStatus::Completed => {
                tracing::info!(group_id = %group_id, child_id = %child_id, outputs = outputs.len(), "Child completed")
            }
            _ => tracing::warn!(
                group_id = %group_id,
                child_id = %child_id,
                status = ?status,
                error = error.as_deref().unwrap_or(""),
                "Child did not complete",
            ),
        }
        self.emit(
            group_id,
            event_type,
            json!({
                "child_id": child_id,
                "backend_id": child.backend_id,
                "seed": child.seed,
                "outputs": child.outputs,
                "error": child.error,
                "elapsed_secs": child.elapsed_secs(),
            }),
        )
        .await;
    }

    /// Apply `change` to a child, persisting the group when `persist` is
    /// set. Returns the updated child, or `None` when the change was refused
    /// (e.g. already terminal).
    async fn update_child<F>(
        &self,
        handle: &GroupHandle,
        child_id: Uuid,
        persist: bool,
        change: F,
    ) -> Option<ChildJob>
    where
        F: FnOnce(&mut ChildJob) -> Result<(), CoreError>,
    {
        let snapshot = {
            let mut group = handle.group.write().await;
            let child = group.child_mut(child_id)?;
            if let Err(e) = change(child) {
                tracing::debug!(child_id = %child_id, error = %e, "Child update refused");
                return None;
            }
            group.clone()
        };
        if persist {
            self.persist(&snapshot).await;
        }
        snapshot.child(child_id).cloned()
    }

    async fn persist(&self, group: &JobGroup) {
        if let Err(e) = self.store.save_group(group).await {
            tracing::error!(group_id = %group.id, error = %e, "Failed to persist job group");
        }
    }

    async fn emit(&self, group_id: Uuid, event_type: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("group_id".to_string(), json!(group_id));
        }
        let event = PlatformEvent::new(event_type)
            .with_source("job_group", group_id)
            .with_payload(payload);
        self.sinks.dispatch(&group_id.to_string(), &event).await;
        self.bus.publish(event);
    }
}
