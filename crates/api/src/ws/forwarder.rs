use std::sync::Arc;

use canvasflow_events::EventBus;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::ws::manager::WsManager;

/// Spawn a task that forwards every event published on `bus` to all
/// WebSocket clients until `cancel` fires or the bus closes.
pub fn start_event_forwarder(
    bus: &EventBus,
    ws_manager: Arc<WsManager>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => {
                        ws_manager.broadcast_event(&event).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WebSocket forwarder lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        tracing::info!("WebSocket event forwarder stopped");
    })
}
