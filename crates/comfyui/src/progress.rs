//! Per-prompt progress over the ComfyUI WebSocket.
//!
//! The socket carries events for every prompt submitted with the same client
//! id. [`interpret`] narrows a raw [`ComfyUIMessage`] down to the
//! [`ProgressUpdate`]s of a single prompt; [`WsProgressChannel`] applies it
//! to a live connection.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio_tungstenite::tungstenite::Message;

use crate::backend::BackendError;
use crate::client::ComfyUIConnection;
use crate::messages::{parse_message, ComfyUIMessage};

/// Progress of one submitted prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressUpdate {
    Started,
    Executing {
        node: String,
    },
    Progress {
        value: i64,
        max: i64,
        node: Option<String>,
    },
    Cached {
        nodes: Vec<String>,
    },
    Completed,
    Error {
        node_id: String,
        node_type: Option<String>,
        message: String,
        exception_type: String,
        traceback: Vec<String>,
    },
    Interrupted,
}

impl ProgressUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error { .. } | Self::Interrupted)
    }

    /// Step percentage for `Progress` updates.
    pub fn percent(&self) -> Option<u8> {
        match self {
            Self::Progress { value, max, .. } if *max > 0 => {
                Some(((*value as f64 / *max as f64) * 100.0).clamp(0.0, 100.0) as u8)
            }
            _ => None,
        }
    }
}

/// Map a socket message to an update for `prompt_id`.
///
/// Messages naming another prompt, queue status broadcasts and per-node
/// output notices yield `None`. `progress` messages without a prompt id are
/// attributed to the watched prompt.
pub fn interpret(message: ComfyUIMessage, prompt_id: &str) -> Option<ProgressUpdate> {
    if message.prompt_id().is_some_and(|p| p != prompt_id) {
        return None;
    }
    match message {
        ComfyUIMessage::Status(_) | ComfyUIMessage::Executed(_) => None,
        ComfyUIMessage::ExecutionStart(_) => Some(ProgressUpdate::Started),
        ComfyUIMessage::ExecutionCached(data) => Some(ProgressUpdate::Cached { nodes: data.nodes }),
        ComfyUIMessage::Executing(data) => match (data.node, data.prompt_id) {
            (Some(node), _) => Some(ProgressUpdate::Executing { node }),
            (None, Some(_)) => Some(ProgressUpdate::Completed),
            (None, None) => None,
        },
        ComfyUIMessage::Progress(data) => Some(ProgressUpdate::Progress {
            value: data.value,
            max: data.max,
            node: data.node,
        }),
        ComfyUIMessage::ExecutionSuccess(_) => Some(ProgressUpdate::Completed),
        ComfyUIMessage::ExecutionError(data) => Some(ProgressUpdate::Error {
            node_id: data.node_id,
            node_type: data.node_type,
            message: data.exception_message,
            exception_type: data.exception_type,
            traceback: data.traceback,
        }),
        ComfyUIMessage::ExecutionInterrupted(_) => Some(ProgressUpdate::Interrupted),
    }
}

/// Source of progress updates, opened before a prompt is submitted so that
/// no early event is missed.
#[async_trait]
pub trait ProgressChannel: Send {
    /// Client id to submit the prompt with.
    fn client_id(&self) -> &str;

    /// Next update for `prompt_id`; `Ok(None)` once the channel closed.
    async fn next_update(&mut self, prompt_id: &str)
        -> Result<Option<ProgressUpdate>, BackendError>;
}

/// [`ProgressChannel`] backed by a ComfyUI WebSocket connection.
pub struct WsProgressChannel {
    connection: ComfyUIConnection,
}

impl WsProgressChannel {
    pub fn new(connection: ComfyUIConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl ProgressChannel for WsProgressChannel {
    fn client_id(&self) -> &str {
        &self.connection.client_id
    }

    async fn next_update(
        &mut self,
        prompt_id: &str,
    ) -> Result<Option<ProgressUpdate>, BackendError> {
        let backend_id = self.connection.backend_id.clone();
        while let Some(frame) = self.connection.ws_stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match parse_message(&text) {
                    Ok(msg) => {
                        if let Some(update) = interpret(msg, prompt_id) {
                            return Ok(Some(update));
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            backend_id = %backend_id,
                            error = %e,
                            "Ignoring unrecognised ComfyUI message",
                        );
                    }
                },
                // Binary frames carry preview images.
                Ok(Message::Binary(_)) => {}
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    tracing::debug!(backend_id = %backend_id, ?frame, "ComfyUI WebSocket closed");
                    return Ok(None);
                }
                Err(e) => {
                    return Err(BackendError::Offline {
                        backend_id,
                        message: format!("WebSocket receive error: {e}"),
                    });
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(json: &str) -> Option<ProgressUpdate> {
        interpret(parse_message(json).unwrap(), "p1")
    }

    #[test]
    fn other_prompts_are_filtered() {
        assert_eq!(run(r#"{"type":"execution_start","data":{"prompt_id":"p2"}}"#), None);
        assert_eq!(
            run(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            Some(ProgressUpdate::Started)
        );
    }

    #[test]
    fn executing_none_completes() {
        assert_eq!(
            run(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#),
            Some(ProgressUpdate::Completed)
        );
        assert_eq!(
            run(r#"{"type":"executing","data":{"node":"4","prompt_id":"p1"}}"#),
            Some(ProgressUpdate::Executing { node: "4".into() })
        );
    }

    #[test]
    fn anonymous_progress_is_attributed() {
        let update = run(r#"{"type":"progress","data":{"value":10,"max":20}}"#).unwrap();
        assert_eq!(update.percent(), Some(50));
        assert!(!update.is_terminal());
    }

    #[test]
    fn error_and_interrupt_are_terminal() {
        let err = run(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"3","exception_message":"OOM","exception_type":"RuntimeError"}}"#,
        )
        .unwrap();
        assert!(err.is_terminal());
        let stop = run(r#"{"type":"execution_interrupted","data":{"prompt_id":"p1"}}"#).unwrap();
        assert_eq!(stop, ProgressUpdate::Interrupted);
    }

    #[test]
    fn status_is_ignored() {
        assert_eq!(
            run(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":0}}}}"#),
            None
        );
    }
}
