//! Job groups: one workflow replicated across several backends, each child
//! running with its own seed.
//!
//! Group status is always derived from the children (see
//! [`derive_group_status`]); it is never stored.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::CoreError;
use crate::seeds::SeedStrategy;
use crate::types::{BackendId, Timestamp};

/// Default per-child timeout when a request omits one.
pub const DEFAULT_CHILD_TIMEOUT_SECS: u64 = 600;

/// Child lifecycle: `Queued -> Running -> {Completed, Failed, Timeout, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl ChildJobStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    pub fn can_transition(self, to: ChildJobStatus) -> bool {
        match self {
            Self::Queued => to != Self::Queued,
            Self::Running => to.is_terminal(),
            _ => false,
        }
    }
}

/// Derived group status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    PartialComplete,
}

/// One replica of the group workflow bound to a backend and a seed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildJob {
    pub id: Uuid,
    pub backend_id: BackendId,
    pub seed: u64,
    pub status: ChildJobStatus,
    pub prompt_id: Option<String>,
    pub progress: u8,
    #[serde(default)]
    pub outputs: Vec<String>,
    pub error: Option<String>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl ChildJob {
    pub fn new(backend_id: impl Into<BackendId>, seed: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend_id: backend_id.into(),
            seed,
            status: ChildJobStatus::Queued,
            prompt_id: None,
            progress: 0,
            outputs: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `to`, stamping timestamps. Terminal children never change.
    pub fn transition(&mut self, to: ChildJobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition(to) {
            return Err(CoreError::Conflict(format!(
                "Invalid child transition: {:?} -> {to:?}",
                self.status
            )));
        }
        self.status = to;
        let now = chrono::Utc::now();
        if to == ChildJobStatus::Running {
            self.started_at = Some(now);
        } else if to.is_terminal() {
            self.completed_at = Some(now);
            if to == ChildJobStatus::Completed {
                self.progress = 100;
            }
        }
        Ok(())
    }

    /// Elapsed seconds between start and completion, if both are known.
    pub fn elapsed_secs(&self) -> Option<f64> {
        let (start, end) = (self.started_at?, self.completed_at?);
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Child tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupCounts {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
}

impl GroupCounts {
    pub fn from_children(children: &[ChildJob]) -> Self {
        let mut counts = Self {
            total: children.len(),
            ..Default::default()
        };
        for child in children {
            match child.status {
                ChildJobStatus::Queued => counts.queued += 1,
                ChildJobStatus::Running => counts.running += 1,
                ChildJobStatus::Completed => counts.completed += 1,
                ChildJobStatus::Failed => counts.failed += 1,
                ChildJobStatus::Timeout => counts.timeout += 1,
                ChildJobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn terminal(&self) -> usize {
        self.completed + self.failed + self.timeout + self.cancelled
    }
}

/// Derive the group status from its children and the cancel flag.
///
/// Evaluated in order: cancelled flag, any child still active, all
/// completed, all failed or timed out, otherwise partial. An empty child
/// list counts as failed.
pub fn derive_group_status(children: &[ChildJob], cancelled: bool) -> GroupStatus {
    if cancelled {
        return GroupStatus::Cancelled;
    }
    if children.is_empty() {
        return GroupStatus::Failed;
    }
    let counts = GroupCounts::from_children(children);
    if counts.queued + counts.running > 0 {
        GroupStatus::Running
    } else if counts.completed == counts.total {
        GroupStatus::Completed
    } else if counts.failed + counts.timeout == counts.total {
        GroupStatus::Failed
    } else {
        GroupStatus::PartialComplete
    }
}

/// A workflow fanned out to several backends with varied seeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobGroup {
    pub id: Uuid,
    /// ComfyUI API-format workflow shared by every child.
    pub workflow: Value,
    pub seed_strategy: SeedStrategy,
    pub base_seed: u64,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timeout_secs: u64,
    pub children: Vec<ChildJob>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl JobGroup {
    pub fn status(&self) -> GroupStatus {
        derive_group_status(&self.children, self.cancelled)
    }

    pub fn counts(&self) -> GroupCounts {
        GroupCounts::from_children(&self.children)
    }

    pub fn child(&self, child_id: Uuid) -> Option<&ChildJob> {
        self.children.iter().find(|c| c.id == child_id)
    }

    pub fn child_mut(&mut self, child_id: Uuid) -> Option<&mut ChildJob> {
        self.children.iter_mut().find(|c| c.id == child_id)
    }

    pub fn all_terminal(&self) -> bool {
        self.children.iter().all(|c| c.status.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
