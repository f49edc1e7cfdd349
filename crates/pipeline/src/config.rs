use std::path::{Path, PathBuf};
use std::time::Duration;

use canvasflow_core::backend::{BackendConfig, DEFAULT_HEALTH_INTERVAL_SECS};
use serde::Deserialize;

use crate::error::PipelineError;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of downloaded outputs (`<output_dir>/<job_id>/`).
    pub output_dir: PathBuf,
    /// Where the job store keeps its JSON documents.
    pub state_dir: PathBuf,
    /// Directory of named workflow templates (`<name>.json`).
    pub workflow_dir: PathBuf,
    /// Optional JSON file listing backends to register at startup.
    pub backends_file: Option<PathBuf>,
    /// Backend used when neither the node nor the job names one.
    pub default_backend: Option<String>,
    /// Ceiling on a single workflow node's execution time.
    pub node_timeout: Duration,
    pub health_interval: Duration,
    /// Output directories older than this are pruned.
    pub output_retention: Duration,
    /// Finished jobs and groups stay in memory this long after finishing.
    pub memory_retention: Duration,
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                 |
    /// |--------------------------|-------------------------|
    /// | `OUTPUT_DIR`             | `./data/outputs`        |
    /// | `STATE_DIR`              | `./data/state`          |
    /// | `WORKFLOW_DIR`           | `./workflows`           |
    /// | `BACKENDS_FILE`          | unset                   |
    /// | `DEFAULT_BACKEND`        | unset                   |
    /// | `NODE_TIMEOUT_SECS`      | `1800`                  |
    /// | `HEALTH_INTERVAL_SECS`   | `15`                    |
    /// | `OUTPUT_RETENTION_HOURS` | `168`                   |
    /// | `MEMORY_RETENTION_SECS`  | `600`                   |
    pub fn from_env() -> Self {
        let output_dir = std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "./data/outputs".into());
        let state_dir = std::env::var("STATE_DIR").unwrap_or_else(|_| "./data/state".into());
        let workflow_dir = std::env::var("WORKFLOW_DIR").unwrap_or_else(|_| "./workflows".into());
        let backends_file = std::env::var("BACKENDS_FILE").ok().filter(|s| !s.is_empty());
        let default_backend = std::env::var("DEFAULT_BACKEND").ok().filter(|s| !s.is_empty());

        let node_timeout_secs: u64 = std::env::var("NODE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "1800".into())
            .parse()
            .expect("NODE_TIMEOUT_SECS must be a valid u64");

        let health_interval_secs: u64 = std::env::var("HEALTH_INTERVAL_SECS")
            .unwrap_or_else(|_| DEFAULT_HEALTH_INTERVAL_SECS.to_string())
            .parse()
            .expect("HEALTH_INTERVAL_SECS must be a valid u64");

        let retention_hours: u64 = std::env::var("OUTPUT_RETENTION_HOURS")
            .unwrap_or_else(|_| "168".into())
            .parse()
            .expect("OUTPUT_RETENTION_HOURS must be a valid u64");

        let memory_retention_secs: u64 = std::env::var("MEMORY_RETENTION_SECS")
            .unwrap_or_else(|_| "600".into())
            .parse()
            .expect("MEMORY_RETENTION_SECS must be a valid u64");

        Self {
            output_dir: output_dir.into(),
            state_dir: state_dir.into(),
            workflow_dir: workflow_dir.into(),
            backends_file: backends_file.map(PathBuf::from),
            default_backend,
            node_timeout: Duration::from_secs(node_timeout_secs),
            health_interval: Duration::from_secs(health_interval_secs.max(1)),
            output_retention: Duration::from_secs(retention_hours * 3600),
            memory_retention: Duration::from_secs(memory_retention_secs),
        }
    }

    /// Configuration rooted in `dir`, for tests and embedded use.
    pub fn rooted_at(dir: &Path) -> Self {
        Self {
            output_dir: dir.join("outputs"),
            state_dir: dir.join("state"),
            workflow_dir: dir.join("workflows"),
            backends_file: None,
            default_backend: None,
            node_timeout: Duration::from_secs(1800),
            health_interval: Duration::from_secs(DEFAULT_HEALTH_INTERVAL_SECS),
            output_retention: Duration::from_secs(168 * 3600),
            memory_retention: Duration::from_secs(600),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BackendsDocument {
    List(Vec<BackendConfig>),
    Wrapped { backends: Vec<BackendConfig> },
}

/// Read backend definitions from a JSON file holding either an array or
/// `{"backends": [...]}`. Every entry is validated.
pub async fn load_backends(path: &Path) -> Result<Vec<BackendConfig>, PipelineError> {
    let raw = tokio::fs::read_to_string(path).await?;
    let backends = match serde_json::from_str::<BackendsDocument>(&raw) {
        Ok(BackendsDocument::List(list)) | Ok(BackendsDocument::Wrapped { backends: list }) => list,
        Err(e) => {
            return Err(PipelineError::Core(
                canvasflow_core::error::CoreError::Validation(format!(
                    "Invalid backends file {}: {e}",
                    path.display()
                )),
            ))
        }
    };
    for backend in &backends {
        backend.validate()?;
    }
    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn backends_file_accepts_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.json");
        std::fs::write(&list, r#"[{"id": "gpu-1", "host": "10.0.0.5"}]"#).unwrap();
        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            r#"{"backends": [{"id": "gpu-2", "host": "10.0.0.6", "port": 8190}]}"#,
        )
        .unwrap();

        let a = load_backends(&list).await.unwrap();
        assert_eq!(a[0].id, "gpu-1");
        assert_eq!(a[0].port, 8188);
        let b = load_backends(&wrapped).await.unwrap();
        assert_eq!(b[0].port, 8190);
    }

    #[tokio::test]
    async fn malformed_backends_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{"nope": 1}"#).unwrap();
        assert!(load_backends(&path).await.is_err());
    }
}
