//! Handlers for the canvas node kinds.
//!
//! Every node is compiled into a [`NodeAction`] once, when its job is
//! created, so malformed configuration (a bad condition expression, an
//! unknown fan-out mode) is rejected before anything runs. All kinds except
//! `Workflow` execute locally; `Workflow` nodes go through the dispatcher.

use std::collections::{BTreeSet, HashMap};

use canvasflow_core::canvas::{CanvasLayout, CanvasNode, NodeKind, DEFAULT_OUTPUT_PORT};
use canvasflow_core::condition::Condition;
use canvasflow_core::error::CoreError;
use canvasflow_core::job::PortMap;
use canvasflow_core::types::NodeId;
use serde_json::{json, Value};

use crate::error::PipelineError;
use crate::media::validate_input_file;

/// Conventional input port name.
pub const INPUT_PORT: &str = "input";

/// Upper bound on a Fanout node's `outputs` setting.
pub const MAX_FANOUT_OUTPUTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanoutMode {
    Broadcast,
    RoundRobin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Collect,
    ConcatImages,
}

/// Compiled behaviour of one canvas node.
#[derive(Debug, Clone)]
pub enum NodeAction {
    Input { file_path: Option<String> },
    Condition { condition: Condition },
    Fanout { mode: FanoutMode, outputs: usize },
    /// `fan_in_ports` lists ports fed by more than one connection; their
    /// values arrive as arrays and are flattened when merging.
    Merge { mode: MergeMode, fan_in_ports: BTreeSet<String> },
    Output,
    Workflow,
    Marker,
}

impl NodeAction {
    pub fn is_workflow(&self) -> bool {
        matches!(self, Self::Workflow)
    }
}

pub type ActionTable = HashMap<NodeId, NodeAction>;

/// Compile every node of `canvas`.
pub fn compile_all(canvas: &CanvasLayout) -> Result<ActionTable, CoreError> {
    canvas
        .nodes
        .iter()
        .map(|node| compile(canvas, node).map(|a| (node.id.clone(), a)))
        .collect()
}

pub fn compile(canvas: &CanvasLayout, node: &CanvasNode) -> Result<NodeAction, CoreError> {
    let action = match node.kind {
        NodeKind::Input => NodeAction::Input {
            file_path: node.config_str("file_path").map(str::to_string),
        },
        NodeKind::Condition => {
            let expression = node.config_str("expression").ok_or_else(|| {
                CoreError::Validation(format!("Condition node \"{}\" has no expression", node.id))
            })?;
            NodeAction::Condition {
                condition: Condition::parse(expression)?,
            }
        }
        NodeKind::Fanout => {
            let mode = match node.config_str("mode").unwrap_or("broadcast") {
                "broadcast" => FanoutMode::Broadcast,
                "round_robin" => FanoutMode::RoundRobin,
                other => {
                    return Err(CoreError::Validation(format!(
                        "Fanout node \"{}\" has unknown mode \"{other}\"",
                        node.id
                    )))
                }
            };
            let outputs = match node.config.get("outputs").and_then(Value::as_u64) {
                Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
                None => wired_output_count(canvas, &node.id),
            };
            if outputs == 0 {
                return Err(CoreError::Validation(format!(
                    "Fanout node \"{}\" has no outputs",
                    node.id
                )));
            }
            if outputs > MAX_FANOUT_OUTPUTS {
                return Err(CoreError::Validation(format!(
                    "Fanout node \"{}\" has {outputs} outputs, at most {MAX_FANOUT_OUTPUTS} are allowed",
                    node.id
                )));
            }
            NodeAction::Fanout { mode, outputs }
        }
        NodeKind::Merge => {
            let mode = match node.config_str("mode").unwrap_or("collect") {
                "collect" => MergeMode::Collect,
                "concat_images" => MergeMode::ConcatImages,
                other => {
                    return Err(CoreError::Validation(format!(
                        "Merge node \"{}\" has unknown mode \"{other}\"",
                        node.id
                    )))
                }
            };
            let mut per_port: HashMap<&str, usize> = HashMap::new();
            for conn in canvas.incoming(&node.id) {
                *per_port.entry(conn.target_port.as_str()).or_default() += 1;
            }
            let fan_in_ports = per_port
                .into_iter()
                .filter(|(_, n)| *n > 1)
                .map(|(p, _)| p.to_string())
                .collect();
            NodeAction::Merge { mode, fan_in_ports }
        }
        NodeKind::Output => NodeAction::Output,
        NodeKind::Workflow => NodeAction::Workflow,
        NodeKind::Execute => NodeAction::Marker,
    };
    Ok(action)
}

/// Highest `output_<i>` port wired from `node_id`, plus one.
fn wired_output_count(canvas: &CanvasLayout, node_id: &str) -> usize {
    canvas
        .connections
        .iter()
        .filter(|c| c.source == node_id)
        .filter_map(|c| c.source_port.strip_prefix("output_")?.parse::<usize>().ok())
        .map(|i| i + 1)
        .max()
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Local execution
// ---------------------------------------------------------------------------

/// Run a non-workflow node over its resolved inputs.
pub fn run_local(action: &NodeAction, inputs: &PortMap) -> Result<PortMap, PipelineError> {
    let mut out = PortMap::new();
    match action {
        NodeAction::Input { file_path } => {
            let media = validate_input_file(file_path.as_deref())?;
            out.insert(DEFAULT_OUTPUT_PORT.to_string(), media.to_value());
        }
        NodeAction::Condition { condition } => {
            let passthrough = primary_input(inputs);
            let mut scope = inputs.clone();
            scope.insert(INPUT_PORT.to_string(), passthrough.clone());
            scope.insert("inputs".to_string(), Value::Object(inputs.clone()));
            let result = condition.evaluate(&Value::Object(scope));
            let port = if result { "true" } else { "false" };
            out.insert(port.to_string(), passthrough);
            out.insert("result".to_string(), Value::Bool(result));
        }
        NodeAction::Fanout { mode, outputs } => {
            let value = primary_input(inputs);
            match mode {
                FanoutMode::Broadcast => {
                    for i in 0..*outputs {
                        out.insert(format!("output_{i}"), value.clone());
                    }
                }
                FanoutMode::RoundRobin => {
                    let items = match value {
                        Value::Array(items) => items,
                        other => vec![other],
                    };
                    let mut buckets = vec![Vec::new(); *outputs];
                    for (i, item) in items.into_iter().enumerate() {
                        buckets[i % outputs].push(item);
                    }
                    for (i, bucket) in buckets.into_iter().enumerate() {
                        out.insert(format!("output_{i}"), Value::Array(bucket));
                    }
                }
            }
        }
        NodeAction::Merge { mode, fan_in_ports } => {
            let items = ordered_inputs(inputs, fan_in_ports);
            let merged = match mode {
                MergeMode::Collect => Value::Array(items),
                MergeMode::ConcatImages => {
                    let images: Vec<Value> = items.iter().flat_map(images_of).collect();
                    json!({ "images": images })
                }
            };
            out.insert(DEFAULT_OUTPUT_PORT.to_string(), merged);
        }
        NodeAction::Output => {
            out = inputs.clone();
        }
        NodeAction::Workflow | NodeAction::Marker => {
            return Err(PipelineError::Core(CoreError::Internal(
                "node kind is not executed locally".to_string(),
            )));
        }
    }
    Ok(out)
}

/// The value an Output node records in `Job.outputs`: the sole input when
/// there is one, otherwise the whole port map.
pub fn output_value(outputs: &PortMap) -> Value {
    match outputs.len() {
        1 => outputs.values().next().cloned().unwrap_or(Value::Null),
        _ => Value::Object(outputs.clone()),
    }
}

/// The `input` port, else the only port, else the whole map.
fn primary_input(inputs: &PortMap) -> Value {
    if let Some(v) = inputs.get(INPUT_PORT) {
        return v.clone();
    }
    output_value(inputs)
}

/// Input values in natural port order (`in_2` before `in_10`), fan-in
/// arrays flattened.
fn ordered_inputs(inputs: &PortMap, fan_in_ports: &BTreeSet<String>) -> Vec<Value> {
    let mut ports: Vec<&String> = inputs.keys().collect();
    ports.sort_by_key(|p| natural_key(p));
    let mut items = Vec::new();
    for port in ports {
        match (&inputs[port.as_str()], fan_in_ports.contains(port.as_str())) {
            (Value::Array(values), true) => items.extend(values.iter().cloned()),
            (value, _) => items.push(value.clone()),
        }
    }
    items
}

fn natural_key(port: &str) -> (String, u64) {
    let digits = port.len() - port.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let (prefix, suffix) = port.split_at(port.len() - digits);
    (prefix.to_string(), suffix.parse().unwrap_or(0))
}

fn images_of(value: &Value) -> Vec<Value> {
    match value {
        Value::Object(obj) => obj
            .get("images")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        Value::Array(items) => items.iter().flat_map(images_of).collect(),
        Value::String(_) => vec![value.clone()],
        _ => Vec::new(),
    }
}
