use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use canvasflow_core::backend::{BackendConfig, BackendStatus};
use serde::Serialize;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// A registered backend with its last polled status. Credentials are never
/// serialized.
#[derive(Debug, Serialize)]
pub struct BackendView {
    #[serde(flatten)]
    pub config: BackendConfig,
    pub status: BackendStatus,
    pub available: bool,
}

/// GET /api/backends
pub async fn list_backends(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let data: Vec<BackendView> = state
        .registry
        .candidates()
        .await
        .into_iter()
        .map(|candidate| {
            let available = candidate.is_available();
            BackendView {
                config: candidate.config,
                status: candidate.status,
                available,
            }
        })
        .collect();
    Ok(Json(DataResponse { data }))
}
