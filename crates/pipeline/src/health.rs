//! Periodic backend health polling.
//!
//! Every tick the monitor queries `system_stats` and `queue_depth` on each
//! registered backend concurrently and writes the resulting
//! [`BackendStatus`]. Online/offline transitions are published on the bus.

use std::sync::Arc;
use std::time::Duration;

use canvasflow_comfyui::BackendClient;
use canvasflow_core::backend::BackendStatus;
use canvasflow_core::job_events;
use canvasflow_events::{EventBus, PlatformEvent};
use tokio_util::sync::CancellationToken;

use crate::registry::BackendRegistry;

pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    bus: Arc<EventBus>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, bus: Arc<EventBus>, interval: Duration) -> Self {
        Self {
            registry,
            bus,
            interval,
        }
    }

    /// Run the polling loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Backend health monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Backend health monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
            }
        }
    }

    /// Poll every registered backend once. Returns how many are online.
    pub async fn poll_once(&self) -> usize {
        let ids = self.registry.ids().await;
        let mut clients = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(client) = self.registry.client(&id).await {
                clients.push((id, client));
            }
        }

        let probes = clients
            .into_iter()
            .map(|(id, client)| async move { (id, probe(client.as_ref()).await) });
        let results = futures::future::join_all(probes).await;

        let mut online = 0;
        for (backend_id, status) in results {
            if status.online {
                online += 1;
            }
            let now_online = status.online;
            let last_error = status.last_error.clone();
            match self.registry.update_status(&backend_id, status).await {
                Some(was_online) if was_online != now_online => {
                    let event_type = if now_online {
                        tracing::info!(backend_id = %backend_id, "Backend came online");
                        job_events::BACKEND_ONLINE
                    } else {
                        tracing::warn!(
                            backend_id = %backend_id,
                            error = last_error.as_deref().unwrap_or(""),
                            "Backend went offline",
                        );
                        job_events::BACKEND_OFFLINE
                    };
                    self.bus.publish(
                        PlatformEvent::new(event_type)
                            .with_source("backend", &backend_id)
                            .with_payload(serde_json::json!({
                                "backend_id": backend_id,
                                "error": last_error,
                            })),
                    );
                }
                Some(_) => {}
                // Unregistered while the probe was in flight.
                None => {}
            }
        }
        online
    }
}

async fn probe(client: &dyn BackendClient) -> BackendStatus {
    let stats = match client.system_stats().await {
        Ok(stats) => stats,
        Err(e) => return BackendStatus::offline(e.to_string()),
    };
    let queue_depth = match client.queue_depth().await {
        Ok(depth) => depth,
        Err(e) => return BackendStatus::offline(e.to_string()),
    };
    BackendStatus {
        online: true,
        queue_depth,
        vram_free: stats.vram_free,
        vram_total: stats.vram_total,
        last_seen: Some(chrono::Utc::now()),
        last_error: None,
    }
}
