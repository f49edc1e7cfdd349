//! Job and node-execution models plus their state rules.
//!
//! A [`Job`] binds an immutable canvas snapshot to global parameter values
//! and owns one [`NodeExecution`] per canvas node. Only the job manager
//! mutates a job while it runs; the mutations go through the methods here so
//! status transitions stay consistent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::canvas::CanvasLayout;
use crate::error::CoreError;
use crate::types::{BackendId, NodeId, Timestamp};

/// Output data of one node, keyed by port name.
pub type PortMap = Map<String, Value>;

/// Error message recorded when a user cancels a job.
pub const CANCELLED_BY_USER: &str = "cancelled by user";

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Job lifecycle: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid targets reachable from `self`.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[Self::Running, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed],
            Self::Completed | Self::Failed => &[],
        }
    }

    pub fn can_transition(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }
}

/// Per-node execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never scheduled: an execute marker, outside the executable set, or
    /// pruned because no upstream branch delivered data.
    Skipped,
    /// Cancelled individually by the user.
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    /// Terminal without an error.
    pub fn is_settled_ok(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// NodeExecution
// ---------------------------------------------------------------------------

/// Execution record of one canvas node within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: Uuid,
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub backend_id: Option<BackendId>,
    /// Worker-assigned job id (ComfyUI `prompt_id`).
    pub prompt_id: Option<String>,
    /// Completion percentage (0-100).
    pub progress: u8,
    pub current_step: Option<String>,
    #[serde(default)]
    pub inputs: PortMap,
    #[serde(default)]
    pub outputs: PortMap,
    pub error: Option<String>,
    pub error_trace: Option<String>,
    /// Dispatch attempts (failover adds one).
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl NodeExecution {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.into(),
            status: NodeStatus::Pending,
            backend_id: None,
            prompt_id: None,
            progress: 0,
            current_step: None,
            inputs: PortMap::new(),
            outputs: PortMap::new(),
            error: None,
            error_trace: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self, inputs: PortMap) {
        self.status = NodeStatus::Running;
        self.inputs = inputs;
        self.started_at = Some(chrono::Utc::now());
    }

    /// Record a progress update; the percentage is clamped to 100.
    pub fn set_progress(&mut self, percent: u8, step: Option<String>) {
        self.progress = percent.min(100);
        if step.is_some() {
            self.current_step = step;
        }
    }

    pub fn mark_completed(&mut self, outputs: PortMap) {
        self.status = NodeStatus::Completed;
        self.outputs = outputs;
        self.progress = 100;
        self.completed_at = Some(chrono::Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, trace: Option<String>) {
        self.status = NodeStatus::Failed;
        self.error = Some(error.into());
        self.error_trace = trace;
        self.completed_at = Some(chrono::Utc::now());
    }

    pub fn mark_skipped(&mut self) {
        self.status = NodeStatus::Skipped;
        self.completed_at = Some(chrono::Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = NodeStatus::Cancelled;
        self.error = Some(CANCELLED_BY_USER.to_string());
        self.completed_at = Some(chrono::Utc::now());
    }

    /// Clear dispatch state before retrying on another backend.
    pub fn reset_for_retry(&mut self) {
        self.status = NodeStatus::Running;
        self.backend_id = None;
        self.prompt_id = None;
        self.progress = 0;
        self.current_step = None;
        self.outputs.clear();
        self.error = None;
        self.error_trace = None;
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Node tallies by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
}

/// One instantiation of a canvas with bound parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub project_id: Option<Uuid>,
    /// Index of the stream this job was materialized from (multi-stream mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_index: Option<usize>,
    pub status: JobStatus,
    pub canvas: CanvasLayout,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Job-level backend override used when a node has no affinity.
    #[serde(default)]
    pub target_backend: Option<BackendId>,
    pub nodes: Vec<NodeExecution>,
    /// Collected results keyed by output-node id.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    /// Snapshot `canvas` into a new pending job with one execution record per
    /// node.
    pub fn new(
        project_id: Option<Uuid>,
        canvas: CanvasLayout,
        parameters: Map<String, Value>,
        target_backend: Option<BackendId>,
    ) -> Self {
        let nodes = canvas
            .nodes
            .iter()
            .map(|n| NodeExecution::new(n.id.clone()))
            .collect();
        Self {
            id: Uuid::new_v4(),
            project_id,
            stream_index: None,
            status: JobStatus::Pending,
            canvas,
            parameters,
            target_backend,
            nodes,
            outputs: Map::new(),
            error: None,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeExecution> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    pub fn node_mut(&mut self, node_id: &str) -> Option<&mut NodeExecution> {
        self.nodes.iter_mut().find(|n| n.node_id == node_id)
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition(to) {
            return Err(CoreError::Conflict(format!(
                "Invalid job transition: {:?} -> {to:?}",
                self.status
            )));
        }
        self.status = to;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(chrono::Utc::now());
        Ok(())
    }

    /// Settle the job from its node states: completed iff every node settled
    /// without error.
    pub fn finish(&mut self) -> Result<JobStatus, CoreError> {
        let ok = self.nodes.iter().all(|n| n.status.is_settled_ok());
        if ok {
            self.transition(JobStatus::Completed)?;
        } else {
            if self.error.is_none() {
                self.error = self
                    .nodes
                    .iter()
                    .find(|n| n.status == NodeStatus::Failed)
                    .and_then(|n| n.error.clone())
                    .or_else(|| Some("one or more nodes did not complete".to_string()));
            }
            self.transition(JobStatus::Failed)?;
        }
        self.completed_at = Some(chrono::Utc::now());
        Ok(self.status)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.error = Some(error.into());
        self.transition(JobStatus::Failed)?;
        self.completed_at = Some(chrono::Utc::now());
        Ok(())
    }

    pub fn counts(&self) -> NodeCounts {
        let mut counts = NodeCounts {
            total: self.nodes.len(),
            ..Default::default()
        };
        for node in &self.nodes {
            match node.status {
                NodeStatus::Pending => counts.pending += 1,
                NodeStatus::Running => counts.running += 1,
                NodeStatus::Completed => counts.completed += 1,
                NodeStatus::Failed => counts.failed += 1,
                NodeStatus::Skipped => counts.skipped += 1,
                NodeStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    /// Overall progress as the mean of node progress over scheduled nodes.
    pub fn progress_percent(&self) -> u8 {
        let scheduled: Vec<&NodeExecution> = self
            .nodes
            .iter()
            .filter(|n| n.status != NodeStatus::Skipped)
            .collect();
        if scheduled.is_empty() {
            return if self.status == JobStatus::Completed { 100 } else { 0 };
        }
        let sum: u32 = scheduled.iter().map(|n| n.progress as u32).sum();
        (sum / scheduled.len() as u32) as u8
    }

    /// Every execution record must refer to a node of the snapshot.
    pub fn validate_invariants(&self) -> Result<(), CoreError> {
        for exec in &self.nodes {
            if !self.canvas.contains(&exec.node_id) {
                return Err(CoreError::Validation(format!(
                    "Node execution refers to unknown node \"{}\"",
                    exec.node_id
                )));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Inputs gathered for one node from its upstream connections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    /// Values keyed by target port. A port fed by several connections holds
    /// an array of the delivered values in connection order.
    pub values: PortMap,
    /// Number of incoming connections.
    pub incoming: usize,
    /// Number of incoming connections that delivered a value.
    pub delivered: usize,
}

impl ResolvedInputs {
    /// True when the node has upstream connections but none delivered data,
    /// e.g. it sits on the inactive side of a condition.
    pub fn is_starved(&self) -> bool {
        self.incoming > 0 && self.delivered == 0
    }
}

/// Completed outputs of one stream, keyed by node id.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    outputs: HashMap<NodeId, PortMap>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, node_id: impl Into<NodeId>, outputs: PortMap) {
        self.outputs.insert(node_id.into(), outputs);
    }

    pub fn outputs_of(&self, node_id: &str) -> Option<&PortMap> {
        self.outputs.get(node_id)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Collect the values flowing into `node_id` over its connections.
    pub fn resolve_inputs(&self, canvas: &CanvasLayout, node_id: &str) -> ResolvedInputs {
        let mut fan_in: HashMap<&str, usize> = HashMap::new();
        for conn in canvas.incoming(node_id) {
            *fan_in.entry(conn.target_port.as_str()).or_default() += 1;
        }

        let mut resolved = ResolvedInputs::default();
        for conn in canvas.incoming(node_id) {
            resolved.incoming += 1;
            let Some(value) = self
                .outputs
                .get(&conn.source)
                .and_then(|ports| ports.get(&conn.source_port))
            else {
                continue;
            };
            resolved.delivered += 1;
            if fan_in.get(conn.target_port.as_str()).copied().unwrap_or(0) > 1 {
                let slot = resolved
                    .values
                    .entry(conn.target_port.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = slot {
                    items.push(value.clone());
                }
            } else {
                resolved
                    .values
                    .insert(conn.target_port.clone(), value.clone());
            }
        }
        resolved
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
