use std::sync::Arc;

use canvasflow_events::{EventBus, SinkRegistry};
use canvasflow_pipeline::{BackendRegistry, Engine, JobManager, ParallelJobManager};

use crate::config::ServerConfig;
use crate::error::{AppError, AppResult};
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable: every field is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// WebSocket connection manager (browser clients).
    pub ws_manager: Arc<WsManager>,
    pub event_bus: Arc<EventBus>,
    pub sinks: Arc<SinkRegistry>,
    pub registry: Arc<BackendRegistry>,
    pub jobs: Arc<JobManager>,
    /// `None` while the parallel manager is not running; job-group
    /// endpoints answer 503.
    pub groups: Option<Arc<ParallelJobManager>>,
}

impl AppState {
    pub fn from_engine(engine: &Engine, config: Arc<ServerConfig>, ws_manager: Arc<WsManager>) -> Self {
        Self {
            config,
            ws_manager,
            event_bus: Arc::clone(&engine.bus),
            sinks: Arc::clone(&engine.sinks),
            registry: Arc::clone(&engine.registry),
            jobs: Arc::clone(&engine.jobs),
            groups: Some(Arc::clone(&engine.groups)),
        }
    }

    pub fn groups(&self) -> AppResult<&Arc<ParallelJobManager>> {
        self.groups.as_ref().ok_or_else(|| {
            AppError::ServiceUnavailable("Parallel job manager is not initialized".to_string())
        })
    }
}
