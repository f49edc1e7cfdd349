use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use canvasflow_core::error::CoreError;
use canvasflow_pipeline::PipelineError;
use serde_json::json;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] and [`PipelineError`] and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Pipeline(PipelineError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A component the endpoint depends on is not running.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Core(core) => AppError::Core(core),
            other => AppError::Pipeline(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => classify_core_error(core),

            // --- Engine errors ---
            AppError::Pipeline(err) => classify_pipeline_error(err),

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn classify_core_error(core: &CoreError) -> (StatusCode, &'static str, String) {
    match core {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}

/// Map an engine error onto an HTTP status, error code and message.
///
/// - No usable backend and bad media map to 400.
/// - Backend transport and submission failures map to 502.
/// - Timeouts map to 504.
/// - Store and I/O failures map to 500 with a sanitized message.
fn classify_pipeline_error(err: &PipelineError) -> (StatusCode, &'static str, String) {
    match err {
        PipelineError::Core(core) => classify_core_error(core),
        PipelineError::NoBackendAvailable(msg) => {
            (StatusCode::BAD_REQUEST, "NO_BACKEND_AVAILABLE", msg.clone())
        }
        PipelineError::Media(msg) => (StatusCode::BAD_REQUEST, "MEDIA_ERROR", msg.clone()),
        PipelineError::BackendOffline { .. } | PipelineError::WorkflowSubmission(_) => {
            (StatusCode::BAD_GATEWAY, "BACKEND_ERROR", err.to_string())
        }
        PipelineError::Execution { .. } => {
            (StatusCode::BAD_GATEWAY, "EXECUTION_ERROR", err.to_string())
        }
        PipelineError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string()),
        PipelineError::Cancelled => (StatusCode::CONFLICT, "CANCELLED", err.to_string()),
        PipelineError::Store(_) | PipelineError::Io(_) => {
            tracing::error!(error = %err, "Engine storage error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            )
        }
    }
}
