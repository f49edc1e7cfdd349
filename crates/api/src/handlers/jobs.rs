//! Handlers for the `/jobs` and `/projects/run` resources.
//!
//! Jobs run in the background; the create endpoints return as soon as the
//! job is persisted. Progress is observed through `GET /jobs/{id}` or the
//! WebSocket event stream.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use canvasflow_core::canvas::{CanvasLayout, Project};
use canvasflow_core::job::{Job, JobStatus, NodeCounts};
use canvasflow_core::types::{BackendId, Timestamp};
use canvasflow_pipeline::{JobManager, WorkflowCallback, WorkflowCompletion};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJob {
    pub project_id: Option<Uuid>,
    pub canvas: CanvasLayout,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub target_backend: Option<BackendId>,
}

#[derive(Debug, Deserialize)]
pub struct RunProject {
    pub project: Project,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    pub target_backend: Option<BackendId>,
}

/// List entry for a job, without the canvas snapshot and per-node records.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_index: Option<usize>,
    pub status: JobStatus,
    pub progress: u8,
    pub counts: NodeCounts,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            project_id: job.project_id,
            stream_index: job.stream_index,
            status: job.status,
            progress: job.progress_percent(),
            counts: job.counts(),
            error: job.error.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Create and run
// ---------------------------------------------------------------------------

/// POST /api/jobs
///
/// Validate the canvas, persist a pending job and start it in the
/// background. Returns 201 with the pending job.
pub async fn create_job(
    State(state): State<AppState>,
    Json(input): Json<CreateJob>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .jobs
        .create_job(
            input.project_id,
            input.canvas,
            input.parameters,
            input.target_backend,
        )
        .await?;

    let jobs = Arc::clone(&state.jobs);
    let job_id = job.id;
    tokio::spawn(async move {
        if let Err(e) = jobs.run_job(job_id).await {
            tracing::error!(job_id = %job_id, error = %e, "Job run failed");
        }
    });

    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

/// POST /api/projects/run
///
/// Split the project canvas into its executable streams and run each as its
/// own job. Returns 201 with one summary per stream job.
pub async fn run_project(
    State(state): State<AppState>,
    Json(input): Json<RunProject>,
) -> AppResult<impl IntoResponse> {
    let jobs = state
        .jobs
        .create_project_streams(&input.project, input.parameters, input.target_backend)
        .await?;
    let data: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();

    let manager: Arc<JobManager> = Arc::clone(&state.jobs);
    let project_id = input.project.id;
    tokio::spawn(async move {
        if let Err(e) = manager.run_streams(jobs, Some(log_completion())).await {
            tracing::error!(project_id = %project_id, error = %e, "Project run failed");
        }
    });

    Ok((StatusCode::CREATED, Json(DataResponse { data })))
}

fn log_completion() -> WorkflowCallback {
    Arc::new(|done: WorkflowCompletion| {
        tracing::info!(
            job_id = %done.job_id,
            stream_index = ?done.stream_index,
            node_id = %done.node_id,
            ports = done.outputs.len(),
            "Workflow node completed",
        );
    })
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// GET /api/jobs
pub async fn list_jobs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let jobs = state.jobs.list_jobs().await?;
    let data: Vec<JobSummary> = jobs.iter().map(JobSummary::from).collect();
    Ok(Json(DataResponse { data }))
}

/// GET /api/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.jobs.get_job(job_id).await?;
    Ok(Json(DataResponse { data: job }))
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// POST /api/jobs/{id}/cancel
///
/// A running job settles asynchronously; the returned job may still show
/// `running`. Cancelling a finished job is a 409.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.jobs.cancel_job(job_id).await?;
    tracing::info!(job_id = %job_id, "Job cancel requested");
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/jobs/{id}/nodes/{node_id}/cancel
pub async fn cancel_node(
    State(state): State<AppState>,
    Path((job_id, node_id)): Path<(Uuid, String)>,
) -> AppResult<StatusCode> {
    state.jobs.cancel_node(job_id, &node_id).await?;
    tracing::info!(job_id = %job_id, node_id = %node_id, "Node cancel requested");
    Ok(StatusCode::NO_CONTENT)
}
