//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management,
//! HTTP API wrappers, retry logic, per-prompt progress tracking and the
//! [`BackendClient`](backend::BackendClient) trait the engine dispatches
//! through.

pub mod api;
pub mod backend;
pub mod client;
pub mod messages;
pub mod progress;
pub mod reconnect;

pub use backend::{BackendClient, BackendError, ComfyUIBackend, OutputFile, SystemStats};
pub use progress::{ProgressChannel, ProgressUpdate};
