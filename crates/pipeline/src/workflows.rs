//! Where workflow templates referenced by canvas nodes come from.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use canvasflow_core::canvas::CanvasNode;
use canvasflow_core::error::CoreError;
use canvasflow_core::workflow::{validate_workflow_name, WorkflowTemplate};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::PipelineError;

/// Node config key holding an inline workflow instead of a reference.
pub const INLINE_WORKFLOW_KEY: &str = "workflow";

#[async_trait]
pub trait WorkflowSource: Send + Sync {
    async fn load(&self, name: &str) -> Result<WorkflowTemplate, PipelineError>;
}

/// Resolve the template of a Workflow node: an inline `config.workflow`
/// object wins over the node's `workflow` reference.
pub async fn resolve_template(
    source: &dyn WorkflowSource,
    node: &CanvasNode,
) -> Result<WorkflowTemplate, PipelineError> {
    if let Some(inline) = node.config.get(INLINE_WORKFLOW_KEY).filter(|v| v.is_object()) {
        let name = node.workflow.clone().unwrap_or_else(|| node.id.clone());
        return Ok(WorkflowTemplate::from_value(name, inline.clone())?);
    }
    let name = node.workflow.as_deref().ok_or_else(|| {
        CoreError::Validation(format!("Workflow node \"{}\" has no workflow", node.id))
    })?;
    source.load(name).await
}

// ---------------------------------------------------------------------------
// Directory source
// ---------------------------------------------------------------------------

/// Templates stored as `<dir>/<name>.json`.
pub struct DirectoryWorkflows {
    dir: PathBuf,
}

impl DirectoryWorkflows {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl WorkflowSource for DirectoryWorkflows {
    async fn load(&self, name: &str) -> Result<WorkflowTemplate, PipelineError> {
        validate_workflow_name(name)?;
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(
                CoreError::Validation(format!("Invalid workflow name \"{name}\"")).into(),
            );
        }
        let path = self.dir.join(format!("{name}.json"));
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound {
                    entity: "Workflow",
                    id: name.to_string(),
                }
                .into())
            }
            Err(e) => return Err(e.into()),
        };
        let value: Value = serde_json::from_slice(&raw).map_err(|e| {
            CoreError::Validation(format!("Workflow \"{name}\" is not valid JSON: {e}"))
        })?;
        Ok(WorkflowTemplate::from_value(name, value)?)
    }
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryWorkflows {
    templates: RwLock<HashMap<String, WorkflowTemplate>>,
}

impl MemoryWorkflows {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, template: WorkflowTemplate) {
        self.templates
            .write()
            .await
            .insert(template.name.clone(), template);
    }
}

#[async_trait]
impl WorkflowSource for MemoryWorkflows {
    async fn load(&self, name: &str) -> Result<WorkflowTemplate, PipelineError> {
        self.templates
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "Workflow",
                    id: name.to_string(),
                }
                .into()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvasflow_core::canvas::NodeKind;
    use serde_json::json;

    #[tokio::test]
    async fn directory_source_reads_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("upscale.json"),
            json!({"1": {"class_type": "LoadImage", "inputs": {"image": ""}}}).to_string(),
        )
        .unwrap();
        let source = DirectoryWorkflows::new(dir.path());

        let template = source.load("upscale").await.unwrap();
        assert_eq!(template.name, "upscale");
        assert!(source.load("missing").await.is_err());
        assert!(source.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn inline_workflow_wins() {
        let source = MemoryWorkflows::new();
        let node = CanvasNode::new("B", NodeKind::Workflow)
            .with_workflow("not-registered")
            .with_config(
                INLINE_WORKFLOW_KEY,
                json!({"1": {"class_type": "SaveImage", "inputs": {}}}),
            );
        let template = resolve_template(&source, &node).await.unwrap();
        assert!(template.workflow.get("1").is_some());

        let bare = CanvasNode::new("C", NodeKind::Workflow);
        assert!(resolve_template(&source, &bare).await.is_err());
    }
}
