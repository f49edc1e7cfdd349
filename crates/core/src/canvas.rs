//! Canvas model: typed nodes, named-port connections and viewport.
//!
//! A [`CanvasLayout`] is owned by a [`Project`] and copied into every job as
//! an immutable snapshot at submission time. Validation here is structural
//! only (ids, references, cycles, limits); node-specific configuration is
//! checked when the job manager compiles its handler table.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::{BackendId, NodeId};

// ---------------------------------------------------------------------------
// Canvas defaults
// ---------------------------------------------------------------------------

/// Default canvas viewport zoom level.
pub const DEFAULT_ZOOM: f64 = 1.0;

/// Minimum allowed zoom level.
pub const MIN_ZOOM: f64 = 0.1;

/// Maximum allowed zoom level.
pub const MAX_ZOOM: f64 = 4.0;

/// Maximum number of nodes allowed on a single canvas.
pub const MAX_NODES_PER_CANVAS: usize = 500;

/// Port name every single-output node writes to.
pub const DEFAULT_OUTPUT_PORT: &str = "output";

// ---------------------------------------------------------------------------
// Node kinds
// ---------------------------------------------------------------------------

/// Closed set of canvas node kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    #[serde(alias = "workflow")]
    Workflow,
    #[serde(alias = "input")]
    Input,
    #[serde(alias = "output")]
    Output,
    #[serde(alias = "condition")]
    Condition,
    #[serde(alias = "fanout")]
    Fanout,
    #[serde(alias = "merge")]
    Merge,
    #[serde(alias = "execute")]
    Execute,
}

impl NodeKind {
    /// Marker nodes select what runs but are never dispatched themselves.
    pub fn is_marker(self) -> bool {
        matches!(self, Self::Execute)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Workflow => "WORKFLOW",
            Self::Input => "INPUT",
            Self::Output => "OUTPUT",
            Self::Condition => "CONDITION",
            Self::Fanout => "FANOUT",
            Self::Merge => "MERGE",
            Self::Execute => "EXECUTE",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Nodes, connections, layout
// ---------------------------------------------------------------------------

/// Cosmetic node position on the canvas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A single node on the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasNode {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub position: Position,
    /// Workflow reference (only meaningful for workflow nodes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
    /// Per-node parameter overrides. These win over global job parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Backend affinity for workflow nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_backend: Option<BackendId>,
    /// Free-form, kind-specific configuration.
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl CanvasNode {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            position: Position::default(),
            workflow: None,
            parameters: Map::new(),
            preferred_backend: None,
            config: Map::new(),
        }
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.workflow = Some(workflow.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn with_backend(mut self, backend_id: impl Into<BackendId>) -> Self {
        self.preferred_backend = Some(backend_id.into());
        self
    }

    /// Read a string entry from the node config.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// A directed data connection between two named ports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanvasConnection {
    pub source: NodeId,
    #[serde(default = "default_port")]
    pub source_port: String,
    pub target: NodeId,
    #[serde(default = "default_port")]
    pub target_port: String,
}

fn default_port() -> String {
    DEFAULT_OUTPUT_PORT.to_string()
}

impl CanvasConnection {
    pub fn new(
        source: impl Into<NodeId>,
        source_port: impl Into<String>,
        target: impl Into<NodeId>,
        target_port: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
        }
    }
}

/// Viewport metadata (cosmetic).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            zoom: DEFAULT_ZOOM,
        }
    }
}

/// Nodes, connections and viewport of one canvas.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanvasLayout {
    #[serde(default)]
    pub nodes: Vec<CanvasNode>,
    #[serde(default)]
    pub connections: Vec<CanvasConnection>,
    #[serde(default)]
    pub viewport: Viewport,
}

impl CanvasLayout {
    pub fn new(nodes: Vec<CanvasNode>, connections: Vec<CanvasConnection>) -> Self {
        Self {
            nodes,
            connections,
            viewport: Viewport::default(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&CanvasNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.id == id)
    }

    /// Connections whose target is `id`, in canvas order.
    pub fn incoming<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a CanvasConnection> + 'a {
        self.connections.iter().filter(move |c| c.target == id)
    }

    pub fn has_execute_nodes(&self) -> bool {
        self.nodes.iter().any(|n| n.kind == NodeKind::Execute)
    }

    /// Copy of this canvas restricted to `ids`. Connections crossing the
    /// boundary are dropped.
    pub fn subgraph(&self, ids: &[NodeId]) -> CanvasLayout {
        let keep: HashSet<&str> = ids.iter().map(String::as_str).collect();
        CanvasLayout {
            nodes: self
                .nodes
                .iter()
                .filter(|n| keep.contains(n.id.as_str()))
                .cloned()
                .collect(),
            connections: self
                .connections
                .iter()
                .filter(|c| keep.contains(c.source.as_str()) && keep.contains(c.target.as_str()))
                .cloned()
                .collect(),
            viewport: self.viewport,
        }
    }

    /// Structural validation: limits, unique ids, dangling references,
    /// self loops and cycles.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_node_count(self.nodes.len())?;
        validate_zoom(self.viewport.zoom)?;

        let mut seen = HashSet::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if node.id.is_empty() {
                return Err(CoreError::Validation("Node id must not be empty".into()));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(CoreError::Validation(format!(
                    "Duplicate node id \"{}\"",
                    node.id
                )));
            }
        }

        for conn in &self.connections {
            for end in [&conn.source, &conn.target] {
                if !seen.contains(end.as_str()) {
                    return Err(CoreError::Validation(format!(
                        "Connection {} -> {} references unknown node \"{end}\"",
                        conn.source, conn.target
                    )));
                }
            }
            if conn.source == conn.target {
                return Err(CoreError::Validation(format!(
                    "Node \"{}\" is connected to itself",
                    conn.source
                )));
            }
        }

        if let Some(node) = self.find_cycle_member() {
            return Err(CoreError::Validation(format!(
                "Canvas contains a cycle through node \"{node}\""
            )));
        }

        Ok(())
    }

    /// Kahn's algorithm; returns a node left over when a cycle exists.
    fn find_cycle_member(&self) -> Option<&str> {
        let mut indegree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.id.as_str(), 0)).collect();
        let mut edges: HashSet<(&str, &str)> = HashSet::new();
        for c in &self.connections {
            if edges.insert((c.source.as_str(), c.target.as_str())) {
                if let Some(d) = indegree.get_mut(c.target.as_str()) {
                    *d += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for (s, t) in &edges {
                if *s == id {
                    if let Some(d) = indegree.get_mut(t) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(*t);
                        }
                    }
                }
            }
        }

        if visited == indegree.len() {
            None
        } else {
            indegree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(id, _)| id)
                .min()
        }
    }
}

/// A saved canvas with identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: uuid::Uuid,
    pub name: String,
    pub canvas: CanvasLayout,
}

impl Project {
    pub fn new(name: impl Into<String>, canvas: CanvasLayout) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name: name.into(),
            canvas,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Validate that a node count does not exceed the canvas limit.
pub fn validate_node_count(count: usize) -> Result<(), CoreError> {
    if count > MAX_NODES_PER_CANVAS {
        Err(CoreError::Validation(format!(
            "Canvas has {count} nodes, exceeding the maximum of {MAX_NODES_PER_CANVAS}"
        )))
    } else {
        Ok(())
    }
}

/// Validate that a zoom level is within allowed bounds.
pub fn validate_zoom(zoom: f64) -> Result<(), CoreError> {
    if !(MIN_ZOOM..=MAX_ZOOM).contains(&zoom) {
        Err(CoreError::Validation(format!(
            "Zoom {zoom} is outside the allowed range [{MIN_ZOOM}, {MAX_ZOOM}]"
        )))
    } else {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
