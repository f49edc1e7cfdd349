use axum::routing::{get, post};
use axum::Router;

use crate::handlers::job_groups;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/job-group", post(job_groups::submit_group))
        .route("/job-groups", get(job_groups::list_groups))
        .route(
            "/job-groups/{id}",
            get(job_groups::get_group).delete(job_groups::cancel_group),
        )
        .route("/job-groups/{id}/events", get(job_groups::group_events))
}
