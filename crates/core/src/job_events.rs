//! Event type names published on the event bus and forwarded to WebSocket
//! and SSE subscribers.
//!
//! Used by the job managers in `canvasflow-pipeline` and by the api crate's
//! progress forwarder.

// ---------------------------------------------------------------------------
// Single jobs
// ---------------------------------------------------------------------------

/// Job entered the running state.
pub const JOB_STARTED: &str = "job_started";

/// Aggregate progress update for a job.
pub const JOB_PROGRESS: &str = "job_progress";

pub const JOB_COMPLETED: &str = "job_completed";

pub const JOB_FAILED: &str = "job_failed";

/// Job was cancelled by the user (the job itself is recorded as failed).
pub const JOB_CANCELLED: &str = "job_cancelled";

pub const NODE_STARTED: &str = "node_started";

/// Sampler step progress from the backend.
pub const NODE_PROGRESS: &str = "node_progress";

pub const NODE_COMPLETED: &str = "node_completed";

pub const NODE_FAILED: &str = "node_failed";

/// Never scheduled, or pruned by an inactive condition branch.
pub const NODE_SKIPPED: &str = "node_skipped";

pub const NODE_CANCELLED: &str = "node_cancelled";

/// Dispatch moved to another backend after the first went offline.
pub const NODE_FAILOVER: &str = "node_failover";

/// A workflow node finished inside a multi-stream run.
pub const WORKFLOW_COMPLETED: &str = "workflow_completed";

// ---------------------------------------------------------------------------
// Job groups
// ---------------------------------------------------------------------------

pub const GROUP_CREATED: &str = "group_created";

/// Every child reached a terminal state.
pub const GROUP_COMPLETED: &str = "group_completed";

pub const GROUP_CANCELLED: &str = "group_cancelled";

pub const CHILD_STARTED: &str = "child_started";

pub const CHILD_PROGRESS: &str = "child_progress";

pub const CHILD_COMPLETED: &str = "child_completed";

pub const CHILD_FAILED: &str = "child_failed";

pub const CHILD_TIMEOUT: &str = "child_timeout";

pub const CHILD_CANCELLED: &str = "child_cancelled";

// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

pub const BACKEND_ONLINE: &str = "backend_online";

pub const BACKEND_OFFLINE: &str = "backend_offline";

/// True for event types that end a job or group.
pub fn is_terminal_event(event_type: &str) -> bool {
    matches!(
        event_type,
        JOB_COMPLETED | JOB_FAILED | JOB_CANCELLED | GROUP_COMPLETED | GROUP_CANCELLED
    )
}
