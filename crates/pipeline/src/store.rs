//! Persistence of jobs and job groups.
//!
//! [`FileJobStore`] keeps one JSON document per entity under a state
//! directory, written to a temporary file and renamed into place so a crash
//! never leaves a torn document. [`MemoryJobStore`] backs tests and
//! ephemeral deployments.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use canvasflow_core::job::Job;
use canvasflow_core::job_group::JobGroup;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::PipelineError;

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, job: &Job) -> Result<(), PipelineError>;
    async fn load_job(&self, id: Uuid) -> Result<Option<Job>, PipelineError>;
    /// Every stored job, newest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError>;

    async fn save_group(&self, group: &JobGroup) -> Result<(), PipelineError>;
    async fn load_group(&self, id: Uuid) -> Result<Option<JobGroup>, PipelineError>;
    /// Every stored group, newest first.
    async fn list_groups(&self) -> Result<Vec<JobGroup>, PipelineError>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    groups: RwLock<HashMap<Uuid, JobGroup>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save_job(&self, job: &Job) -> Result<(), PipelineError> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>, PipelineError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn save_group(&self, group: &JobGroup) -> Result<(), PipelineError> {
        self.groups.write().await.insert(group.id, group.clone());
        Ok(())
    }

    async fn load_group(&self, id: Uuid) -> Result<Option<JobGroup>, PipelineError> {
        Ok(self.groups.read().await.get(&id).cloned())
    }

    async fn list_groups(&self) -> Result<Vec<JobGroup>, PipelineError> {
        let mut groups: Vec<JobGroup> = self.groups.read().await.values().cloned().collect();
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(groups)
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

const JOBS_DIR: &str = "jobs";
const GROUPS_DIR: &str = "groups";

/// JSON documents at `<root>/jobs/<id>.json` and `<root>/groups/<id>.json`.
pub struct FileJobStore {
    root: PathBuf,
}

impl FileJobStore {
    /// Open (and create) the store under `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, PipelineError> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(JOBS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(GROUPS_DIR)).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, kind: &str, id: Uuid) -> PathBuf {
        self.root.join(kind).join(format!("{id}.json"))
    }

    async fn write_document<T: Serialize + Sync>(
        &self,
        kind: &str,
        id: Uuid,
        value: &T,
    ) -> Result<(), PipelineError> {
        let path = self.path_for(kind, id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn read_document<T: DeserializeOwned>(
        &self,
        kind: &str,
        id: Uuid,
    ) -> Result<Option<T>, PipelineError> {
        let path = self.path_for(kind, id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_all<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>, PipelineError> {
        let mut entries = tokio::fs::read_dir(self.root.join(kind)).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice(&bytes) {
                Ok(doc) => out.push(doc),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable state document");
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn save_job(&self, job: &Job) -> Result<(), PipelineError> {
        self.write_document(JOBS_DIR, job.id, job).await
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<Job>, PipelineError> {
        self.read_document(JOBS_DIR, id).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs: Vec<Job> = self.read_all(JOBS_DIR).await?;
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn save_group(&self, group: &JobGroup) -> Result<(), PipelineError> {
        self.write_document(GROUPS_DIR, group.id, group).await
    }

    async fn load_group(&self, id: Uuid) -> Result<Option<JobGroup>, PipelineError> {
        self.read_document(GROUPS_DIR, id).await
    }

    async fn list_groups(&self) -> Result<Vec<JobGroup>, PipelineError> {
        let mut groups: Vec<JobGroup> = self.read_all(GROUPS_DIR).await?;
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(groups)
    }
}
