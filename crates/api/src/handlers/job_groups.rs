//! Handlers for the `/job-group` and `/job-groups` resources: parallel
//! seed-variation runs of one workflow across several backends.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use canvasflow_events::PlatformEvent;
use canvasflow_pipeline::parallel::{GroupSummary, GroupView};
use canvasflow_pipeline::JobGroupRequest;
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

/// POST /api/job-group
///
/// Create a group with one child per valid backend and start every child.
/// Returns 201 with the group view; 400 when no requested backend is usable.
pub async fn submit_group(
    State(state): State<AppState>,
    Json(input): Json<JobGroupRequest>,
) -> AppResult<impl IntoResponse> {
    let groups = state.groups()?;
    let group = groups.submit_group(input).await?;

    tracing::info!(
        group_id = %group.id,
        children = group.children.len(),
        "Job group submitted",
    );

    Ok((
        StatusCode::CREATED,
        Json(DataResponse {
            data: GroupView::from(&group),
        }),
    ))
}

/// GET /api/job-groups
pub async fn list_groups(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    let groups = state.groups()?.list_groups().await?;
    let data: Vec<GroupSummary> = groups.iter().map(GroupSummary::from).collect();
    Ok(Json(DataResponse { data }))
}

/// GET /api/job-groups/{id}
pub async fn get_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let group = state.groups()?.get_group(group_id).await?;
    Ok(Json(DataResponse {
        data: GroupView::from(&group),
    }))
}

/// DELETE /api/job-groups/{id}
///
/// Interrupt every queued or running child. Children already finished are
/// counted in `already_complete`.
pub async fn cancel_group(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let response = state.groups()?.cancel_group(group_id).await?;
    tracing::info!(
        group_id = %group_id,
        interrupted = response.interrupted,
        already_complete = response.already_complete,
        "Job group cancelled",
    );
    Ok(Json(DataResponse { data: response }))
}

/// GET /api/job-groups/{id}/events
///
/// Server-Sent Events: a `snapshot` event with the current group view, then
/// every event of the group until it finishes. A finished group gets only
/// the snapshot.
pub async fn group_events(
    State(state): State<AppState>,
    Path(group_id): Path<Uuid>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let groups = state.groups()?;
    let scope = group_id.to_string();

    // Register before reading the snapshot so no event falls in between.
    let (sink_id, rx) = groups.sinks().register(&scope).await;
    let group = match groups.get_group(group_id).await {
        Ok(group) => group,
        Err(e) => {
            groups.sinks().unregister(&scope, sink_id).await;
            return Err(e.into());
        }
    };
    let live = if group.completed_at.is_some() {
        groups.sinks().unregister(&scope, sink_id).await;
        None
    } else {
        Some(rx)
    };

    tracing::debug!(group_id = %group_id, live = live.is_some(), "Job group event stream opened");

    let snapshot = sse_event("snapshot", &GroupView::from(&group));
    let events = futures::stream::iter(live)
        .flat_map(ReceiverStream::new)
        .map(|event: PlatformEvent| Ok::<_, Infallible>(sse_event(&event.event_type, &event)));
    let stream = futures::stream::once(async move { Ok::<_, Infallible>(snapshot) }).chain(events);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event<T: Serialize>(name: &str, data: &T) -> Event {
    Event::default()
        .event(name)
        .json_data(data)
        .unwrap_or_else(|e| {
            tracing::warn!(event = name, error = %e, "Failed to encode SSE event");
            Event::default().comment("encoding error")
        })
}
