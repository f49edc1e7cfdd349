//! Registered render backends, their live status and selection.
//!
//! The status map is written only by the [`HealthMonitor`](crate::health::HealthMonitor)
//! and by explicit registration; every dispatch path reads it.

use std::collections::HashMap;
use std::sync::Arc;

use canvasflow_comfyui::{BackendClient, ComfyUIBackend};
use canvasflow_core::backend::{
    select_backend, BackendCandidate, BackendConfig, BackendStatus, SelectionRequest,
};
use canvasflow_core::error::CoreError;
use canvasflow_core::types::BackendId;
use tokio::sync::RwLock;

use crate::error::PipelineError;

struct RegisteredBackend {
    config: BackendConfig,
    status: BackendStatus,
    client: Arc<dyn BackendClient>,
}

/// Backend chosen for a dispatch.
#[derive(Clone)]
pub struct SelectedBackend {
    pub backend_id: BackendId,
    pub client: Arc<dyn BackendClient>,
}

impl std::fmt::Debug for SelectedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectedBackend")
            .field("backend_id", &self.backend_id)
            .finish()
    }
}

pub struct BackendRegistry {
    backends: RwLock<HashMap<BackendId, RegisteredBackend>>,
    default_backend: Option<BackendId>,
}

impl BackendRegistry {
    pub fn new(default_backend: Option<BackendId>) -> Self {
        Self {
            backends: RwLock::new(HashMap::new()),
            default_backend,
        }
    }

    pub fn default_backend(&self) -> Option<&str> {
        self.default_backend.as_deref()
    }

    /// Register (or replace) a backend with an explicit client. New backends
    /// start offline until the health monitor has polled them.
    pub async fn register(
        &self,
        config: BackendConfig,
        client: Arc<dyn BackendClient>,
    ) -> Result<(), PipelineError> {
        config.validate()?;
        if client.backend_id() != config.id {
            return Err(CoreError::Validation(format!(
                "Client for \"{}\" registered under id \"{}\"",
                client.backend_id(),
                config.id
            ))
            .into());
        }
        tracing::info!(backend_id = %config.id, url = %config.http_url(), "Backend registered");
        let id = config.id.clone();
        self.backends.write().await.insert(
            id,
            RegisteredBackend {
                config,
                status: BackendStatus::default(),
                client,
            },
        );
        Ok(())
    }

    /// Register a ComfyUI backend from its configuration.
    pub async fn register_comfyui(&self, config: BackendConfig) -> Result<(), PipelineError> {
        let client = Arc::new(ComfyUIBackend::new(&config));
        self.register(config, client).await
    }

    pub async fn unregister(&self, backend_id: &str) -> bool {
        let removed = self.backends.write().await.remove(backend_id).is_some();
        if removed {
            tracing::info!(backend_id, "Backend unregistered");
        }
        removed
    }

    pub async fn contains(&self, backend_id: &str) -> bool {
        self.backends.read().await.contains_key(backend_id)
    }

    /// Registered and enabled, regardless of whether it is online yet.
    pub async fn is_enabled(&self, backend_id: &str) -> bool {
        self.backends
            .read()
            .await
            .get(backend_id)
            .is_some_and(|b| b.config.enabled)
    }

    pub async fn ids(&self) -> Vec<BackendId> {
        let mut ids: Vec<BackendId> = self.backends.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn client(&self, backend_id: &str) -> Option<Arc<dyn BackendClient>> {
        self.backends
            .read()
            .await
            .get(backend_id)
            .map(|b| Arc::clone(&b.client))
    }

    pub async fn status(&self, backend_id: &str) -> Option<BackendStatus> {
        self.backends
            .read()
            .await
            .get(backend_id)
            .map(|b| b.status.clone())
    }

    /// Replace a backend's live status. Returns the previous `online` flag,
    /// or `None` if the backend is not registered.
    pub async fn update_status(&self, backend_id: &str, status: BackendStatus) -> Option<bool> {
        let mut backends = self.backends.write().await;
        let entry = backends.get_mut(backend_id)?;
        let was_online = entry.status.online;
        entry.status = status;
        Some(was_online)
    }

    /// Snapshot of every backend, sorted by id.
    pub async fn candidates(&self) -> Vec<BackendCandidate> {
        let mut list: Vec<BackendCandidate> = self
            .backends
            .read()
            .await
            .values()
            .map(|b| BackendCandidate {
                config: b.config.clone(),
                status: b.status.clone(),
            })
            .collect();
        list.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        list
    }

    /// Ids of backends that are enabled and online, minus `exclude`.
    pub async fn available_ids(&self, exclude: &[BackendId]) -> Vec<BackendId> {
        self.candidates()
            .await
            .into_iter()
            .filter(|c| c.is_available() && !exclude.contains(&c.config.id))
            .map(|c| c.config.id)
            .collect()
    }

    /// Pick a backend: `affinity`, then the configured default, then the
    /// least loaded available backend.
    pub async fn select_backend(
        &self,
        affinity: Option<&str>,
        required_capabilities: &[String],
        exclude: &[BackendId],
    ) -> Option<SelectedBackend> {
        let backends = self.backends.read().await;
        let candidates: Vec<BackendCandidate> = backends
            .values()
            .map(|b| BackendCandidate {
                config: b.config.clone(),
                status: b.status.clone(),
            })
            .collect();
        let request = SelectionRequest {
            affinity,
            default_backend: self.default_backend.as_deref(),
            required_capabilities,
            exclude,
        };
        let chosen = select_backend(&candidates, &request)?;
        let entry = backends.get(&chosen.config.id)?;
        Some(SelectedBackend {
            backend_id: chosen.config.id.clone(),
            client: Arc::clone(&entry.client),
        })
    }

    /// Look up a specific backend if it is enabled and online.
    pub async fn available(&self, backend_id: &str) -> Option<SelectedBackend> {
        let backends = self.backends.read().await;
        let entry = backends.get(backend_id)?;
        (entry.config.enabled && entry.status.online).then(|| SelectedBackend {
            backend_id: entry.config.id.clone(),
            client: Arc::clone(&entry.client),
        })
    }
}
