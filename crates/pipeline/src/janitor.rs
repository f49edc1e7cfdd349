//! Periodic cleanup of old output directories and finished in-memory state.
//!
//! Job outputs live in `<output_root>/<job_id>/` and group outputs in
//! `<output_root>/groups/<group_id>/`. Directories whose last modification
//! is older than the retention period are removed.
//!
//! Finished jobs and groups are dropped from the managers' live maps once
//! they have been finished for the memory retention period; reads then fall
//! back to the store.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use canvasflow_core::types::Timestamp;
use tokio_util::sync::CancellationToken;

use crate::job_manager::JobManager;
use crate::parallel::ParallelJobManager;

/// How often the cleanup job runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// How often finished jobs and groups are evicted from memory.
const EVICTION_INTERVAL: Duration = Duration::from_secs(60);

const GROUPS_DIR: &str = "groups";

pub struct OutputJanitor {
    output_root: PathBuf,
    retention: Duration,
}

impl OutputJanitor {
    pub fn new(output_root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            output_root: output_root.into(),
            retention,
        }
    }

    /// Run the cleanup loop until `cancel` is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            retention_hours = self.retention.as_secs() / 3600,
            interval_secs = CLEANUP_INTERVAL.as_secs(),
            "Output janitor started"
        );

        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Output janitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    match prune_outputs(&self.output_root, self.retention).await {
                        Ok(0) => tracing::debug!("Output janitor: nothing to prune"),
                        Ok(removed) => tracing::info!(removed, "Output janitor: pruned old directories"),
                        Err(e) => tracing::error!(error = %e, "Output janitor: cleanup failed"),
                    }
                }
            }
        }
    }
}

/// Evicts finished jobs and groups from the managers' live maps.
pub struct StateJanitor {
    jobs: Arc<JobManager>,
    groups: Arc<ParallelJobManager>,
    retention: Duration,
}

impl StateJanitor {
    pub fn new(jobs: Arc<JobManager>, groups: Arc<ParallelJobManager>, retention: Duration) -> Self {
        Self {
            jobs,
            groups,
            retention,
        }
    }

    /// One eviction pass. Returns `(jobs, groups)` evicted.
    pub async fn sweep(&self) -> (usize, usize) {
        (
            self.jobs.evict_finished(self.retention).await,
            self.groups.evict_finished(self.retention).await,
        )
    }

    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            retention_secs = self.retention.as_secs(),
            interval_secs = EVICTION_INTERVAL.as_secs(),
            "State janitor started"
        );
        let mut interval = tokio::time::interval(EVICTION_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("State janitor stopping");
                    break;
                }
                _ = interval.tick() => {
                    let (jobs, groups) = self.sweep().await;
                    if jobs + groups > 0 {
                        tracing::info!(jobs, groups, "State janitor: evicted finished entries");
                    }
                }
            }
        }
    }
}

/// Instant at or before which a finished entry counts as expired.
pub(crate) fn cutoff(retention: Duration) -> Timestamp {
    let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
    chrono::Utc::now()
        .checked_sub_signed(retention)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC)
}

/// Remove job and group output directories older than `retention`.
/// Returns how many were removed. A missing root is not an error.
pub async fn prune_outputs(root: &Path, retention: Duration) -> std::io::Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut removed = prune_dir(root, cutoff, true).await?;
    removed += prune_dir(&root.join(GROUPS_DIR), cutoff, false).await?;
    Ok(removed)
}

async fn prune_dir(dir: &Path, cutoff: SystemTime, skip_groups: bool) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if skip_groups && entry.file_name() == GROUPS_DIR {
            continue;
        }
        let meta = entry.metadata().await?;
        if !meta.is_dir() {
            continue;
        }
        let modified = meta.modified()?;
        if modified < cutoff {
            let path = entry.path();
            tokio::fs::remove_dir_all(&path).await?;
            tracing::debug!(path = %path.display(), "Removed expired output directory");
            removed += 1;
        }
    }
    Ok(removed)
}
