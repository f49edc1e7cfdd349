pub mod backends;
pub mod health;
pub mod job_groups;
pub mod jobs;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api` route tree.
///
/// ```text
/// /ws                                       WebSocket (every engine event)
///
/// /job-group                                submit (POST)
/// /job-groups                               list (GET)
/// /job-groups/{id}                          status (GET), cancel (DELETE)
/// /job-groups/{id}/events                   SSE stream (GET)
///
/// /jobs                                     create + run (POST), list (GET)
/// /jobs/{id}                                get (GET)
/// /jobs/{id}/cancel                         cancel (POST)
/// /jobs/{id}/nodes/{node_id}/cancel         cancel one node (POST)
/// /projects/run                             multi-stream run (POST)
///
/// /backends                                 list with live status (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .merge(job_groups::router())
        .merge(jobs::router())
        .merge(backends::router())
}
