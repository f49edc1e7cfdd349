use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};

use crate::state::AppState;
use crate::ws::manager::WsManager;

/// GET /api/ws -- upgrade to a socket that receives every engine event.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state.ws_manager))
}

/// Pump queued frames out and drain inbound frames on one task until either
/// side closes. Clients only listen, so inbound data frames are ignored.
async fn serve_socket(socket: WebSocket, ws_manager: Arc<WsManager>) {
    let (conn_id, mut outbound) = ws_manager.add().await;
    tracing::info!(conn_id = %conn_id, "WebSocket connected");
    let (mut sink, mut inbound) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(msg) = queued else { break };
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            received = inbound.next() => match received {
                None | Some(Ok(Message::Close(_))) => break,
                Some(Ok(Message::Pong(_))) => tracing::trace!(conn_id = %conn_id, "Pong"),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break;
                }
            },
        }
    }

    ws_manager.remove(conn_id).await;
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}
