//! Wiring of the execution engine's long-lived components.

use std::sync::Arc;

use canvasflow_events::{EventBus, SinkRegistry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{load_backends, EngineConfig};
use crate::dispatch::WorkflowDispatcher;
use crate::error::PipelineError;
use crate::health::HealthMonitor;
use crate::janitor::{OutputJanitor, StateJanitor};
use crate::job_manager::JobManager;
use crate::parallel::ParallelJobManager;
use crate::registry::BackendRegistry;
use crate::store::{FileJobStore, JobStore};
use crate::workflows::{DirectoryWorkflows, WorkflowSource};

pub struct Engine {
    pub config: EngineConfig,
    pub bus: Arc<EventBus>,
    pub sinks: Arc<SinkRegistry>,
    pub registry: Arc<BackendRegistry>,
    pub jobs: Arc<JobManager>,
    pub groups: Arc<ParallelJobManager>,
}

impl Engine {
    /// Build the engine from configuration: file-backed store, workflow
    /// directory and the backends listed in `BACKENDS_FILE`.
    pub async fn build(config: EngineConfig, bus: Arc<EventBus>) -> Result<Self, PipelineError> {
        tokio::fs::create_dir_all(&config.output_dir).await?;
        let store: Arc<dyn JobStore> = Arc::new(FileJobStore::open(&config.state_dir).await?);
        let workflows: Arc<dyn WorkflowSource> =
            Arc::new(DirectoryWorkflows::new(&config.workflow_dir));

        let registry = Arc::new(BackendRegistry::new(config.default_backend.clone()));
        if let Some(path) = &config.backends_file {
            for backend in load_backends(path).await? {
                registry.register_comfyui(backend).await?;
            }
        }

        let engine = Self::from_parts(config, bus, store, workflows, registry);
        engine.jobs.recover_interrupted().await?;
        Ok(engine)
    }

    /// Assemble the engine from explicit components.
    pub fn from_parts(
        config: EngineConfig,
        bus: Arc<EventBus>,
        store: Arc<dyn JobStore>,
        workflows: Arc<dyn WorkflowSource>,
        registry: Arc<BackendRegistry>,
    ) -> Self {
        let sinks = Arc::new(SinkRegistry::new());
        let dispatcher = Arc::new(WorkflowDispatcher::new(
            Arc::clone(&registry),
            workflows,
            config.output_dir.clone(),
            config.node_timeout,
        ));
        let jobs = Arc::new(JobManager::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            dispatcher,
        ));
        let groups = Arc::new(ParallelJobManager::new(
            Arc::clone(&registry),
            store,
            Arc::clone(&bus),
            Arc::clone(&sinks),
            config.output_dir.clone(),
        ));
        Self {
            config,
            bus,
            sinks,
            registry,
            jobs,
            groups,
        }
    }

    /// Poll every backend once so selection has live status from the start.
    pub async fn warm_up(&self) -> usize {
        self.health_monitor().poll_once().await
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.bus),
            self.config.health_interval,
        )
    }

    pub fn state_janitor(&self) -> StateJanitor {
        StateJanitor::new(
            Arc::clone(&self.jobs),
            Arc::clone(&self.groups),
            self.config.memory_retention,
        )
    }

    /// Spawn the health monitor and both janitors.
    pub fn spawn_background(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let monitor = self.health_monitor();
        let health_cancel = cancel.clone();
        let janitor = OutputJanitor::new(self.config.output_dir.clone(), self.config.output_retention);
        let janitor_cancel = cancel.clone();
        let state = self.state_janitor();
        let state_cancel = cancel.clone();
        vec![
            tokio::spawn(async move { monitor.run(health_cancel).await }),
            tokio::spawn(async move { janitor.run(janitor_cancel).await }),
            tokio::spawn(async move { state.run(state_cancel).await }),
        ]
    }
}
