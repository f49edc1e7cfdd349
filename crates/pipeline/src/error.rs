//! Errors raised while running jobs and job groups.

use canvasflow_comfyui::BackendError;
use canvasflow_core::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The backend could not be reached. The only failure that fails over.
    #[error("Backend {backend_id} is offline: {message}")]
    BackendOffline { backend_id: String, message: String },

    #[error("No backend available: {0}")]
    NoBackendAvailable(String),

    /// The backend refused or could not accept the workflow.
    #[error("Workflow submission failed: {0}")]
    WorkflowSubmission(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Cancelled")]
    Cancelled,

    /// The backend reported an error while executing the workflow.
    #[error("Node {node_id} failed: {message}")]
    Execution {
        node_id: String,
        message: String,
        traceback: Option<String>,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl PipelineError {
    pub fn is_backend_offline(&self) -> bool {
        matches!(self, Self::BackendOffline { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Worker-side traceback, when one was reported.
    pub fn traceback(&self) -> Option<&str> {
        match self {
            Self::Execution { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }
}

impl From<BackendError> for PipelineError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Offline {
                backend_id,
                message,
            } => Self::BackendOffline {
                backend_id,
                message,
            },
            BackendError::Rejected {
                backend_id,
                message,
                node_errors,
            } => Self::WorkflowSubmission(format!("{backend_id}: {message} ({node_errors})")),
            BackendError::Api { .. } | BackendError::Protocol { .. } => {
                Self::WorkflowSubmission(err.to_string())
            }
            BackendError::Io(e) => Self::Io(e),
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Render an error with its source chain, one cause per line.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
