//! Canvas job execution.
//!
//! A [`Job`] runs as one scheduler loop over a [`GraphExecutor`]. Ready
//! nodes either run inline (local node kinds) or as tasks in a `JoinSet`
//! (Workflow nodes). The loop reacts to whichever happens first: a task
//! finishing or a progress event from a running dispatch. It ends when
//! nothing is ready and nothing is in flight.
//!
//! Multi-stream mode splits a project canvas into independent streams, each
//! run as its own job in its own task.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use canvasflow_core::canvas::{CanvasLayout, Project};
use canvasflow_core::error::CoreError;
use canvasflow_core::graph::GraphExecutor;
use canvasflow_core::job::{
    ExecutionContext, Job, JobStatus, NodeStatus, PortMap, CANCELLED_BY_USER,
};
use canvasflow_core::job_events;
use canvasflow_core::types::{BackendId, NodeId};
use canvasflow_events::{EventBus, PlatformEvent};
use futures::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatch::{
    DispatchEvent, DispatchOutcome, DispatchRequest, FailoverHandler, WorkflowDispatcher,
};
use crate::error::{error_chain, PipelineError};
use crate::janitor::cutoff;
use crate::nodes::{compile_all, output_value, run_local, ActionTable, NodeAction};
use crate::store::JobStore;

/// Error recorded on in-flight nodes stopped because a sibling failed.
const HALTED_BY_FAILURE: &str = "cancelled after another node failed";

/// A Workflow node finished in multi-stream mode.
#[derive(Debug, Clone)]
pub struct WorkflowCompletion {
    pub job_id: Uuid,
    pub stream_index: Option<usize>,
    pub node_id: NodeId,
    pub outputs: PortMap,
}

pub type WorkflowCallback = Arc<dyn Fn(WorkflowCompletion) + Send + Sync>;

/// Cancellation handles of a job whose scheduler loop is live.
#[derive(Default)]
struct RunningJob {
    cancel: CancellationToken,
    in_flight: Mutex<HashMap<NodeId, CancellationToken>>,
    cancelled_nodes: Mutex<HashSet<NodeId>>,
}

impl RunningJob {
    async fn is_node_cancelled(&self, node_id: &str) -> bool {
        self.cancelled_nodes.lock().await.contains(node_id)
    }
}

pub struct JobManager {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    dispatcher: Arc<WorkflowDispatcher>,
    /// Latest snapshot of every job touched since startup.
    jobs: RwLock<HashMap<Uuid, Job>>,
    actions: RwLock<HashMap<Uuid, Arc<ActionTable>>>,
    running: RwLock<HashMap<Uuid, Arc<RunningJob>>>,
}

impl JobManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<EventBus>,
        dispatcher: Arc<WorkflowDispatcher>,
    ) -> Self {
        Self {
            store,
            bus,
            dispatcher,
            jobs: RwLock::new(HashMap::new()),
            actions: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_failover_handler(&self, handler: Option<Arc<dyn FailoverHandler>>) {
        self.dispatcher.set_failover_handler(handler).await;
    }

    // -----------------------------------------------------------------------
    // Creation and lookup
    // -----------------------------------------------------------------------

    /// Validate `canvas`, compile its nodes and persist a pending job.
    pub async fn create_job(
        &self,
        project_id: Option<Uuid>,
        canvas: CanvasLayout,
        parameters: Map<String, Value>,
        target_backend: Option<BackendId>,
    ) -> Result<Job, PipelineError> {
        self.create_stream_job(project_id, canvas, parameters, target_backend, None)
            .await
    }

    async fn create_stream_job(
        &self,
        project_id: Option<Uuid>,
        canvas: CanvasLayout,
        parameters: Map<String, Value>,
        target_backend: Option<BackendId>,
        stream_index: Option<usize>,
    ) -> Result<Job, PipelineError> {
        canvas.validate()?;
        let actions = compile_all(&canvas)?;
        let mut job = Job::new(project_id, canvas, parameters, target_backend);
        job.stream_index = stream_index;

        self.store.save_job(&job).await?;
        self.jobs.write().await.insert(job.id, job.clone());
        self.actions.write().await.insert(job.id, Arc::new(actions));
        tracing::info!(
            job_id = %job.id,
            nodes = job.nodes.len(),
            stream_index = ?stream_index,
            "Job created",
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job, PipelineError> {
        if let Some(job) = self.jobs.read().await.get(&job_id) {
            return Ok(job.clone());
        }
        self.store.load_job(job_id).await?.ok_or_else(|| {
            CoreError::NotFound {
                entity: "Job",
                id: job_id.to_string(),
            }
            .into()
        })
    }

    /// Every job, newest first, with live snapshots preferred over stored
    /// ones.
    pub async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs = self.store.list_jobs().await?;
        let live = self.jobs.read().await;
        for job in &mut jobs {
            if let Some(current) = live.get(&job.id) {
                *job = current.clone();
            }
        }
        Ok(jobs)
    }

    /// Fail jobs a previous process left running.
    pub async fn recover_interrupted(&self) -> Result<usize, PipelineError> {
        let mut recovered = 0;
        for mut job in self.store.list_jobs().await? {
            if job.status != JobStatus::Running {
                continue;
            }
            for node in &mut job.nodes {
                if node.status == NodeStatus::Running {
                    node.mark_failed("interrupted by restart", None);
                } else if node.status == NodeStatus::Pending {
                    node.mark_skipped();
                }
            }
            job.fail("interrupted by restart")?;
            self.store.save_job(&job).await?;
            recovered += 1;
        }
        if recovered > 0 {
            tracing::warn!(recovered, "Failed jobs interrupted by restart");
        }
        Ok(recovered)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run a pending job to completion and return its final state.
    pub async fn run_job(&self, job_id: Uuid) -> Result<Job, PipelineError> {
        let job = self.get_job(job_id).await?;
        self.run_loaded(job, None).await
    }

    /// Run every executable stream of `project` as its own job, concurrently.
    /// `on_workflow_complete` fires as soon as each Workflow node finishes.
    pub async fn run_project_streams(
        self: &Arc<Self>,
        project: &Project,
        parameters: Map<String, Value>,
        target_backend: Option<BackendId>,
        on_workflow_complete: Option<WorkflowCallback>,
    ) -> Result<Vec<Job>, PipelineError> {
        let jobs = self
            .create_project_streams(project, parameters, target_backend)
            .await?;
        self.run_streams(jobs, on_workflow_complete).await
    }

    /// Create one pending job per executable stream of `project`.
    pub async fn create_project_streams(
        &self,
        project: &Project,
        parameters: Map<String, Value>,
        target_backend: Option<BackendId>,
    ) -> Result<Vec<Job>, PipelineError> {
        project.canvas.validate()?;
        let streams = GraphExecutor::new(&project.canvas).get_executable_streams();
        tracing::info!(project_id = %project.id, streams = streams.len(), "Running project streams");

        let mut jobs = Vec::with_capacity(streams.len());
        for (index, ids) in streams.iter().enumerate() {
            let canvas = project.canvas.subgraph(ids);
            let job = self
                .create_stream_job(
                    Some(project.id),
                    canvas,
                    parameters.clone(),
                    target_backend.clone(),
                    Some(index),
                )
                .await?;
            jobs.push(job);
        }
        Ok(jobs)
    }

    /// Run already created stream jobs, each in its own task.
    pub async fn run_streams(
        self: &Arc<Self>,
        jobs: Vec<Job>,
        on_workflow_complete: Option<WorkflowCallback>,
    ) -> Result<Vec<Job>, PipelineError> {
        let handles: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                let manager = Arc::clone(self);
                let callback = on_workflow_complete.clone();
                tokio::spawn(async move { manager.run_loaded(job, callback).await })
            })
            .collect();

        let mut finished = Vec::with_capacity(handles.len());
        for joined in futures::future::join_all(handles).await {
            let job = joined
                .map_err(|e| CoreError::Internal(format!("stream task failed: {e}")))??;
            finished.push(job);
        }
        Ok(finished)
    }

    async fn run_loaded(
        &self,
        mut job: Job,
        callback: Option<WorkflowCallback>,
    ) -> Result<Job, PipelineError> {
        let running = Arc::new(RunningJob::default());
        {
            let mut map = self.running.write().await;
            if map.contains_key(&job.id) {
                return Err(CoreError::Conflict(format!("Job {} is already running", job.id)).into());
            }
            // Re-read under the lock: a cancel may have settled it meanwhile.
            let status = self.jobs.read().await.get(&job.id).map(|j| j.status);
            if let Some(status) = status {
                job.status = status;
            }
            if job.status != JobStatus::Pending {
                return Err(CoreError::Conflict(format!(
                    "Job {} is {:?}, not pending",
                    job.id, job.status
                ))
                .into());
            }
            map.insert(job.id, Arc::clone(&running));
        }

        let actions = match self.actions.read().await.get(&job.id).cloned() {
            Some(actions) => actions,
            None => Arc::new(compile_all(&job.canvas)?),
        };

        job.start()?;
        self.persist(&job).await;
        self.publish(&job, job_events::JOB_STARTED, json!({"nodes": job.nodes.len()}));
        tracing::info!(job_id = %job.id, "Job started");

        let outcome = JobRun::new(self, &mut job, actions, Arc::clone(&running), callback)
            .drive()
            .await;

        self.running.write().await.remove(&job.id);
        self.actions.write().await.remove(&job.id);

        for node in job.nodes.iter_mut().filter(|n| n.status == NodeStatus::Pending) {
            node.mark_skipped();
        }

        let event_type = match outcome {
            Ok(()) => match job.finish()? {
                JobStatus::Completed => job_events::JOB_COMPLETED,
                _ => job_events::JOB_FAILED,
            },
            Err(PipelineError::Cancelled) => {
                job.fail(CANCELLED_BY_USER)?;
                job_events::JOB_CANCELLED
            }
            Err(e) => {
                job.fail(e.to_string())?;
                job_events::JOB_FAILED
            }
        };
        self.persist(&job).await;
        self.publish(
            &job,
            event_type,
            json!({
                "status": job.status,
                "error": job.error,
                "outputs": job.outputs,
                "counts": job.counts(),
            }),
        );
        tracing::info!(job_id = %job.id, status = ?job.status, error = ?job.error, "Job finished");
        Ok(job)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Cancel a job. A running job is signalled and settles as Failed with
    /// "cancelled by user"; a pending job is failed immediately.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, PipelineError> {
        // Held until the pending job is settled so `run_loaded` cannot start
        // it in between.
        let running = self.running.write().await;
        if let Some(run) = running.get(&job_id) {
            tracing::info!(job_id = %job_id, "Cancelling running job");
            run.cancel.cancel();
            drop(running);
            return self.get_job(job_id).await;
        }

        let mut job = self.get_job(job_id).await?;
        if job.status != JobStatus::Pending {
            return Err(CoreError::Conflict(format!(
                "Job {job_id} is already {:?}",
                job.status
            ))
            .into());
        }
        for node in &mut job.nodes {
            node.mark_cancelled();
        }
        job.fail(CANCELLED_BY_USER)?;
        self.cache(&job).await;
        drop(running);

        self.actions.write().await.remove(&job_id);
        self.persist(&job).await;
        self.publish(&job, job_events::JOB_CANCELLED, json!({"status": job.status}));
        Ok(job)
    }

    /// Cancel one node of a running job without failing the job. Nodes
    /// downstream of it are pruned.
    pub async fn cancel_node(&self, job_id: Uuid, node_id: &str) -> Result<(), PipelineError> {
        let run = self
            .running
            .read()
            .await
            .get(&job_id)
            .cloned()
            .ok_or_else(|| CoreError::Conflict(format!("Job {job_id} is not running")))?;

        let job = self.get_job(job_id).await?;
        let node = job.node(node_id).ok_or_else(|| CoreError::NotFound {
            entity: "Node",
            id: node_id.to_string(),
        })?;
        if node.status.is_terminal() {
            return Err(CoreError::Conflict(format!(
                "Node {node_id} is already {:?}",
                node.status
            ))
            .into());
        }

        run.cancelled_nodes.lock().await.insert(node_id.to_string());
        if let Some(token) = run.in_flight.lock().await.get(node_id) {
            token.cancel();
        }
        tracing::info!(job_id = %job_id, node_id, "Node cancelled by user");
        Ok(())
    }

    /// Drop cached snapshots of jobs that finished more than `retention`
    /// ago. They stay readable from the store. Returns how many were dropped.
    pub async fn evict_finished(&self, retention: Duration) -> usize {
        let cutoff = cutoff(retention);
        let running = self.running.read().await;
        let mut jobs = self.jobs.write().await;
        let expired: Vec<Uuid> = jobs
            .values()
            .filter(|job| job.status.is_terminal() && !running.contains_key(&job.id))
            .filter(|job| job.completed_at.is_some_and(|at| at <= cutoff))
            .map(|job| job.id)
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        drop(jobs);
        drop(running);

        if !expired.is_empty() {
            let mut actions = self.actions.write().await;
            for id in &expired {
                actions.remove(id);
            }
            tracing::debug!(evicted = expired.len(), "Evicted finished jobs from memory");
        }
        expired.len()
    }

    // -----------------------------------------------------------------------
    // Persistence and events
    // -----------------------------------------------------------------------

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to persist job");
        }
        self.cache(job).await;
    }

    async fn cache(&self, job: &Job) {
        self.jobs.write().await.insert(job.id, job.clone());
    }

    fn publish(&self, job: &Job, event_type: &str, mut payload: Value) {
        if let Value::Object(map) = &mut payload {
            map.insert("job_id".to_string(), json!(job.id));
            if let Some(index) = job.stream_index {
                map.insert("stream_index".to_string(), json!(index));
            }
        }
        self.bus.publish(
            PlatformEvent::new(event_type)
                .with_source("job", job.id)
                .with_payload(payload),
        );
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

type NodeTaskResult = (NodeId, Result<DispatchOutcome, PipelineError>);

/// State of one job's scheduler loop.
struct JobRun<'a> {
    manager: &'a JobManager,
    job: &'a mut Job,
    canvas: CanvasLayout,
    actions: Arc<ActionTable>,
    running: Arc<RunningJob>,
    callback: Option<WorkflowCallback>,
    graph: GraphExecutor,
    context: ExecutionContext,
    tasks: JoinSet<NodeTaskResult>,
    events_tx: mpsc::UnboundedSender<(NodeId, DispatchEvent)>,
    events_rx: mpsc::UnboundedReceiver<(NodeId, DispatchEvent)>,
    /// Stops new launches and in-flight nodes: user cancel or first failure.
    halt: CancellationToken,
    failure: Option<PipelineError>,
}

impl<'a> JobRun<'a> {
    fn new(
        manager: &'a JobManager,
        job: &'a mut Job,
        actions: Arc<ActionTable>,
        running: Arc<RunningJob>,
        callback: Option<WorkflowCallback>,
    ) -> Self {
        let canvas = job.canvas.clone();
        let graph = GraphExecutor::new(&canvas);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let halt = running.cancel.child_token();
        Self {
            manager,
            job,
            canvas,
            actions,
            running,
            callback,
            graph,
            context: ExecutionContext::new(),
            tasks: JoinSet::new(),
            events_tx,
            events_rx,
            halt,
            failure: None,
        }
    }

    async fn drive(mut self) -> Result<(), PipelineError> {
        loop {
            while !self.halt.is_cancelled() {
                let Some(node_id) = self.graph.get_ready_node() else {
                    break;
                };
                self.start_node(node_id).await;
            }

            if self.tasks.is_empty() {
                break;
            }

            // Events first: a task's progress is queued before its result.
            tokio::select! {
                biased;
                Some((node_id, event)) = self.events_rx.recv() => {
                    self.apply_event(&node_id, event).await;
                }
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok((node_id, result)) => self.finish_node(node_id, result).await,
                    Err(e) => tracing::error!(job_id = %self.job.id, error = %e, "Node task aborted"),
                },
            }
        }

        if self.running.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn start_node(&mut self, node_id: NodeId) {
        if self.running.is_node_cancelled(&node_id).await {
            self.settle_cancelled(&node_id, None).await;
            self.graph.on_node_complete(&node_id);
            return;
        }

        let resolved = self.context.resolve_inputs(&self.canvas, &node_id);
        let action = self.actions.get(&node_id).cloned().unwrap_or(NodeAction::Marker);
        if resolved.is_starved() || matches!(action, NodeAction::Marker) {
            if let Some(node) = self.job.node_mut(&node_id) {
                node.mark_skipped();
            }
            self.graph.on_node_complete(&node_id);
            tracing::debug!(job_id = %self.job.id, node_id = %node_id, "Node skipped");
            self.manager
                .publish(self.job, job_events::NODE_SKIPPED, json!({"node_id": node_id}));
            self.manager.persist(self.job).await;
            return;
        }

        let inputs = resolved.values;
        if let Some(node) = self.job.node_mut(&node_id) {
            node.mark_running(inputs.clone());
        }
        self.manager.publish(
            self.job,
            job_events::NODE_STARTED,
            json!({"node_id": node_id, "kind": self.canvas.node(&node_id).map(|n| n.kind)}),
        );

        if !action.is_workflow() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| run_local(&action, &inputs)))
                .unwrap_or_else(|_| {
                    Err(CoreError::Internal(format!("node {node_id} panicked")).into())
                });
            match result {
                Ok(outputs) => self.complete_node(&node_id, &action, outputs).await,
                Err(e) => self.fail_node(&node_id, e).await,
            }
            return;
        }

        self.manager.persist(self.job).await;
        let Some(node) = self.canvas.node(&node_id).cloned() else {
            let err = CoreError::Internal(format!("node {node_id} missing from canvas"));
            self.fail_node(&node_id, err.into()).await;
            return;
        };
        let request = DispatchRequest {
            job_id: self.job.id,
            node,
            parameters: self.job.parameters.clone(),
            inputs,
            target_backend: self.job.target_backend.clone(),
        };
        let token = self.halt.child_token();
        self.running
            .in_flight
            .lock()
            .await
            .insert(node_id.clone(), token.clone());

        let dispatcher = Arc::clone(&self.manager.dispatcher);
        let events = self.events_tx.clone();
        self.tasks.spawn(async move {
            let notify_id = node_id.clone();
            let notify = move |event: DispatchEvent| {
                let _ = events.send((notify_id.clone(), event));
            };
            let result = AssertUnwindSafe(dispatcher.dispatch(&request, &token, &notify))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    Err(CoreError::Internal("workflow dispatch panicked".to_string()).into())
                });
            (node_id, result)
        });
    }

    async fn apply_event(&mut self, node_id: &str, event: DispatchEvent) {
        let Some(node) = self.job.node_mut(node_id) else {
            return;
        };
        if node.status != NodeStatus::Running {
            return;
        }
        match event {
            DispatchEvent::Attempt {
                backend_id,
                attempt,
            } => {
                node.backend_id = Some(backend_id);
                node.attempts = attempt;
                self.manager.persist(self.job).await;
            }
            DispatchEvent::Submitted { prompt_id } => {
                node.prompt_id = Some(prompt_id);
                self.manager.persist(self.job).await;
            }
            DispatchEvent::Progress { percent, step } => {
                node.set_progress(percent, step.clone());
                let progress = node.progress;
                self.manager.publish(
                    self.job,
                    job_events::NODE_PROGRESS,
                    json!({"node_id": node_id, "progress": progress, "step": step}),
                );
                self.manager.publish(
                    self.job,
                    job_events::JOB_PROGRESS,
                    json!({"progress": self.job.progress_percent()}),
                );
                self.manager.cache(self.job).await;
            }
            DispatchEvent::Failover { from, to, reason } => {
                node.reset_for_retry();
                self.manager.publish(
                    self.job,
                    job_events::NODE_FAILOVER,
                    json!({"node_id": node_id, "from": from, "to": to, "reason": reason}),
                );
                self.manager.persist(self.job).await;
            }
        }
    }

    async fn finish_node(&mut self, node_id: NodeId, result: Result<DispatchOutcome, PipelineError>) {
        self.running.in_flight.lock().await.remove(&node_id);
        match result {
            Ok(outcome) => {
                if let Some(node) = self.job.node_mut(&node_id) {
                    node.backend_id = Some(outcome.backend_id.clone());
                    node.prompt_id = Some(outcome.prompt_id.clone());
                    node.attempts = outcome.attempts;
                }
                self.complete_node(&node_id, &NodeAction::Workflow, outcome.to_ports())
                    .await;
            }
            Err(PipelineError::Cancelled) => {
                let by_user = !self.running.cancel.is_cancelled()
                    && self.running.is_node_cancelled(&node_id).await;
                if by_user {
                    self.settle_cancelled(&node_id, None).await;
                    self.graph.on_node_complete(&node_id);
                } else if self.failure.is_some() {
                    self.settle_cancelled(&node_id, Some(HALTED_BY_FAILURE)).await;
                } else {
                    self.settle_cancelled(&node_id, None).await;
                }
            }
            Err(e) => self.fail_node(&node_id, e).await,
        }
    }

    async fn complete_node(&mut self, node_id: &str, action: &NodeAction, outputs: PortMap) {
        if let Some(node) = self.job.node_mut(node_id) {
            node.mark_completed(outputs.clone());
        }
        if matches!(action, NodeAction::Output) {
            self.job
                .outputs
                .insert(node_id.to_string(), output_value(&outputs));
        }
        self.context.record(node_id, outputs.clone());
        self.graph.on_node_complete(node_id);

        tracing::debug!(job_id = %self.job.id, node_id, "Node completed");
        self.manager.publish(
            self.job,
            job_events::NODE_COMPLETED,
            json!({"node_id": node_id, "outputs": outputs}),
        );
        if action.is_workflow() {
            if let Some(callback) = &self.callback {
                callback(WorkflowCompletion {
                    job_id: self.job.id,
                    stream_index: self.job.stream_index,
                    node_id: node_id.to_string(),
                    outputs: outputs.clone(),
                });
                self.manager.publish(
                    self.job,
                    job_events::WORKFLOW_COMPLETED,
                    json!({"node_id": node_id, "outputs": outputs}),
                );
            }
        }
        self.manager.publish(
            self.job,
            job_events::JOB_PROGRESS,
            json!({"progress": self.job.progress_percent()}),
        );
        self.manager.persist(self.job).await;
    }

    /// Record a node failure. The first one halts the job.
    async fn fail_node(&mut self, node_id: &str, error: PipelineError) {
        let trace = error
            .traceback()
            .map(str::to_string)
            .unwrap_or_else(|| error_chain(&error));
        tracing::warn!(job_id = %self.job.id, node_id, error = %error, "Node failed");
        if let Some(node) = self.job.node_mut(node_id) {
            node.mark_failed(error.to_string(), Some(trace));
        }
        self.manager.publish(
            self.job,
            job_events::NODE_FAILED,
            json!({"node_id": node_id, "error": error.to_string()}),
        );
        self.manager.persist(self.job).await;

        if self.failure.is_none() {
            self.failure = Some(error);
            self.halt.cancel();
        }
    }

    async fn settle_cancelled(&mut self, node_id: &str, reason: Option<&str>) {
        if let Some(node) = self.job.node_mut(node_id) {
            node.mark_cancelled();
            if let Some(reason) = reason {
                node.error = Some(reason.to_string());
            }
        }
        self.manager
            .publish(self.job, job_events::NODE_CANCELLED, json!({"node_id": node_id}));
        self.manager.persist(self.job).await;
    }
}
