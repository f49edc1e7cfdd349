//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI instance.  Call [`ComfyUIClient::connect`] to establish a
//! live [`ComfyUIConnection`] over WebSocket.

use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Raw WebSocket stream type used by ComfyUI connections.
pub type ComfyUIStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Configuration handle for a ComfyUI instance's event socket.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    backend_id: String,
    ws_url: String,
    auth_token: Option<String>,
}

/// A live WebSocket connection to a ComfyUI instance.
#[derive(Debug)]
pub struct ComfyUIConnection {
    pub backend_id: String,
    /// Client id sent during the handshake. Prompts submitted with the same
    /// id have their events delivered on this socket.
    pub client_id: String,
    pub ws_stream: ComfyUIStream,
}

impl ComfyUIClient {
    /// * `backend_id` - registry id of this backend.
    /// * `ws_url`     - WebSocket endpoint, e.g. `ws://host:8188/ws`.
    pub fn new(backend_id: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            backend_id: backend_id.into(),
            ws_url: ws_url.into(),
            auth_token: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the ComfyUI WebSocket endpoint with the given client id.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}?clientId={}", self.ws_url, client_id);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ComfyUIClientError::Connection(format!("Invalid URL {url}: {e}")))?;
        if let Some(token) = &self.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ComfyUIClientError::Connection(format!("Invalid auth token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _response) = connect_async(request).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::debug!(
            backend_id = %self.backend_id,
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            backend_id: self.backend_id.clone(),
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A protocol-level error on an already-established connection.
    #[error("Protocol error: {0}")]
    Protocol(String),
}
