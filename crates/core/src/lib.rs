//! Pure domain logic for the canvas execution engine: canvas model, graph
//! scheduling, job and job-group state rules, seeds, backend selection,
//! condition expressions and workflow patching. No I/O.

pub mod backend;
pub mod canvas;
pub mod condition;
pub mod error;
pub mod graph;
pub mod job;
pub mod job_events;
pub mod job_group;
pub mod seeds;
pub mod types;
pub mod workflow;
