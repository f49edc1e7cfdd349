use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// `"ok"` when at least one backend is online (or none are configured).
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    pub backends_online: usize,
    pub backends_total: usize,
    pub ws_connections: usize,
}

/// GET /health -- service and backend fleet health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let candidates = state.registry.candidates().await;
    let backends_total = candidates.len();
    let backends_online = candidates.iter().filter(|c| c.status.online).count();

    let status = if backends_total == 0 || backends_online > 0 {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        backends_online,
        backends_total,
        ws_connections: state.ws_manager.connection_count().await,
    })
}

/// Mount health check routes (root level, not under `/api`).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
