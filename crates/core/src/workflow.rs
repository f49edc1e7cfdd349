//! ComfyUI API-format workflow descriptions and parameter patching.
//!
//! A workflow in API format is a JSON object keyed by node id, each entry
//! holding a `class_type` and an `inputs` object. Inputs that are links to
//! other nodes are encoded as `[source_node_id, output_index]`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;

/// Input names that carry the sampler seed.
const SEED_INPUTS: [&str; 2] = ["seed", "noise_seed"];

/// Maximum length of a workflow name.
pub const MAX_WORKFLOW_NAME_LENGTH: usize = 200;

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Maps a user-facing parameter name onto one workflow input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub name: String,
    pub node_id: String,
    pub input: String,
}

/// A named workflow plus its explicit parameter bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub name: String,
    pub workflow: Value,
    #[serde(default)]
    pub bindings: Vec<ParameterBinding>,
}

impl WorkflowTemplate {
    /// Build a template from a stored document. Accepts either a wrapper
    /// `{"workflow": {...}, "bindings": [...]}` or a bare API-format object.
    pub fn from_value(name: impl Into<String>, value: Value) -> Result<Self, CoreError> {
        let name = name.into();
        validate_workflow_name(&name)?;
        let (workflow, bindings) = match value {
            Value::Object(mut map) if map.contains_key("workflow") => {
                let bindings = match map.remove("bindings") {
                    Some(raw) => serde_json::from_value(raw).map_err(|e| {
                        CoreError::Validation(format!("Invalid bindings in \"{name}\": {e}"))
                    })?,
                    None => Vec::new(),
                };
                (map.remove("workflow").unwrap_or(Value::Null), bindings)
            }
            other => (other, Vec::new()),
        };
        validate_api_workflow(&workflow)?;
        Ok(Self {
            name,
            workflow,
            bindings,
        })
    }
}

// ---------------------------------------------------------------------------
// Widget schema
// ---------------------------------------------------------------------------

/// Input names per node class, as reported by a backend's `object_info`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WidgetSchema {
    inputs: HashMap<String, HashSet<String>>,
}

impl WidgetSchema {
    /// Parse an `object_info` response
    /// (`{class: {"input": {"required": {...}, "optional": {...}}}}`).
    pub fn from_object_info(info: &Value) -> Self {
        let mut inputs = HashMap::new();
        if let Some(classes) = info.as_object() {
            for (class, def) in classes {
                let mut names = HashSet::new();
                for section in ["required", "optional"] {
                    if let Some(fields) = def
                        .get("input")
                        .and_then(|i| i.get(section))
                        .and_then(Value::as_object)
                    {
                        names.extend(fields.keys().cloned());
                    }
                }
                inputs.insert(class.clone(), names);
            }
        }
        Self { inputs }
    }

    pub fn declares(&self, class_type: &str, input: &str) -> bool {
        self.inputs
            .get(class_type)
            .is_some_and(|names| names.contains(input))
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

/// Which parameters were written where.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    /// `node_id.input` targets that received a value.
    pub applied: Vec<String>,
    /// Parameter names that matched nothing.
    pub unmatched: Vec<String>,
}

/// True for a `[node_id, output_index]` link value.
pub fn is_link(value: &Value) -> bool {
    match value.as_array() {
        Some(items) if items.len() == 2 => {
            (items[0].is_string() || items[0].is_u64()) && items[1].is_u64()
        }
        _ => false,
    }
}

/// Write `params` into `workflow`.
///
/// Each parameter is resolved in order: an explicit binding, a
/// `node_id.input` key, then every node exposing a widget of that name
/// (existing non-link input or an input declared by `schema`). Links are
/// never overwritten.
pub fn patch_parameters(
    workflow: &mut Value,
    params: &Map<String, Value>,
    bindings: &[ParameterBinding],
    schema: Option<&WidgetSchema>,
) -> Result<PatchReport, CoreError> {
    let nodes = workflow
        .as_object_mut()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;
    let mut report = PatchReport::default();

    for (key, value) in params {
        let mut hit = false;

        for binding in bindings.iter().filter(|b| &b.name == key) {
            if set_input(nodes, &binding.node_id, &binding.input, value) {
                report.applied.push(format!("{}.{}", binding.node_id, binding.input));
                hit = true;
            }
        }

        if !hit {
            if let Some((node_id, input)) = key.split_once('.') {
                if nodes.contains_key(node_id) && set_input(nodes, node_id, input, value) {
                    report.applied.push(key.clone());
                    hit = true;
                }
            }
        }

        if !hit {
            let targets: Vec<String> = nodes
                .iter()
                .filter(|(_, node)| exposes_widget(node, key, schema))
                .map(|(id, _)| id.clone())
                .collect();
            for node_id in targets {
                if set_input(nodes, &node_id, key, value) {
                    report.applied.push(format!("{node_id}.{key}"));
                    hit = true;
                }
            }
        }

        if !hit {
            report.unmatched.push(key.clone());
        }
    }
    Ok(report)
}

fn exposes_widget(node: &Value, input: &str, schema: Option<&WidgetSchema>) -> bool {
    match node.get("inputs").and_then(|i| i.get(input)) {
        Some(existing) => !is_link(existing),
        None => {
            let class = node.get("class_type").and_then(Value::as_str).unwrap_or("");
            schema.is_some_and(|s| s.declares(class, input))
        }
    }
}

fn set_input(nodes: &mut Map<String, Value>, node_id: &str, input: &str, value: &Value) -> bool {
    let Some(node) = nodes.get_mut(node_id).and_then(Value::as_object_mut) else {
        return false;
    };
    let inputs = node
        .entry("inputs")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(inputs) = inputs.as_object_mut() else {
        return false;
    };
    if inputs.get(input).is_some_and(is_link) {
        return false;
    }
    inputs.insert(input.to_string(), value.clone());
    true
}

/// A node is sampler-like when it carries a literal seed input.
pub fn is_sampler_node(node: &Value) -> bool {
    let Some(inputs) = node.get("inputs") else {
        return false;
    };
    SEED_INPUTS
        .iter()
        .any(|name| inputs.get(*name).is_some_and(|v| !is_link(v)))
}

/// Set `seed` on every sampler-like node. Returns the number of nodes patched.
pub fn patch_seed(workflow: &mut Value, seed: u64) -> usize {
    let Some(nodes) = workflow.as_object_mut() else {
        return 0;
    };
    let mut patched = 0;
    for node in nodes.values_mut() {
        if !is_sampler_node(node) {
            continue;
        }
        if let Some(inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) {
            for name in SEED_INPUTS {
                if inputs.get(name).is_some_and(|v| !is_link(v)) {
                    inputs.insert(name.to_string(), Value::from(seed));
                }
            }
            patched += 1;
        }
    }
    patched
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check the API-format shape: a non-empty object whose entries each carry a
/// string `class_type` and, if present, an object `inputs`.
pub fn validate_api_workflow(workflow: &Value) -> Result<(), CoreError> {
    let obj = workflow
        .as_object()
        .ok_or_else(|| CoreError::Validation("Workflow JSON must be an object".to_string()))?;
    if obj.is_empty() {
        return Err(CoreError::Validation(
            "Workflow JSON must contain at least one node".to_string(),
        ));
    }
    for (node_id, node) in obj {
        if node.get("class_type").and_then(Value::as_str).is_none() {
            return Err(CoreError::Validation(format!(
                "Node '{node_id}' is missing required 'class_type' field"
            )));
        }
        if let Some(inputs) = node.get("inputs") {
            if !inputs.is_object() {
                return Err(CoreError::Validation(format!(
                    "Node '{node_id}' has non-object 'inputs'"
                )));
            }
        }
    }
    Ok(())
}

pub fn validate_workflow_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Validation(
            "Workflow name must not be empty".to_string(),
        ));
    }
    if name.len() > MAX_WORKFLOW_NAME_LENGTH {
        return Err(CoreError::Validation(format!(
            "Workflow name must not exceed {MAX_WORKFLOW_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
