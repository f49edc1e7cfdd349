//! Execution engine: backend registry and health, canvas job execution,
//! workflow dispatch with failover, parallel seed-variation groups and
//! persistence.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod health;
pub mod janitor;
pub mod job_manager;
pub mod media;
pub mod nodes;
pub mod parallel;
pub mod registry;
pub mod store;
pub mod workflows;

pub use engine::Engine;
pub use error::PipelineError;
pub use job_manager::{JobManager, WorkflowCallback, WorkflowCompletion};
pub use parallel::{JobGroupRequest, ParallelJobManager};
pub use registry::BackendRegistry;
pub use store::{FileJobStore, JobStore, MemoryJobStore};
