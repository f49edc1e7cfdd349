//! Canvas jobs run end to end against scripted backends.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;

use canvasflow_core::canvas::{CanvasConnection, CanvasLayout, CanvasNode, NodeKind, Project};
use canvasflow_core::error::CoreError;
use canvasflow_core::job::{JobStatus, NodeStatus, CANCELLED_BY_USER};
use canvasflow_core::job_events;
use canvasflow_pipeline::{PipelineError, WorkflowCallback, WorkflowCompletion};
use common::{wait_until, Behaviour, FakeBackend, Harness};
use serde_json::{json, Map};

fn input(id: &str, path: &std::path::Path) -> CanvasNode {
    CanvasNode::new(id, NodeKind::Input).with_config("file_path", json!(path.to_string_lossy()))
}

fn workflow(id: &str) -> CanvasNode {
    CanvasNode::new(id, NodeKind::Workflow).with_workflow("img2img")
}

fn conn(source: &str, target: &str, target_port: &str) -> CanvasConnection {
    CanvasConnection::new(source, "output", target, target_port)
}

/// `A (input) -> B (workflow) -> C (output)`
fn linear_canvas(h: &Harness) -> CanvasLayout {
    CanvasLayout::new(
        vec![
            input("A", &h.input_file("face.png")),
            workflow("B"),
            CanvasNode::new("C", NodeKind::Output),
        ],
        vec![conn("A", "B", "image"), conn("B", "C", "input")],
    )
}

/// Wait until `node_id` of a running job has been submitted.
async fn wait_for_prompt(h: &Harness, job_id: uuid::Uuid, node_id: &'static str) {
    let jobs = &h.engine.jobs;
    wait_until(move || async move {
        jobs.get_job(job_id)
            .await
            .is_ok_and(|j| j.node(node_id).is_some_and(|n| n.prompt_id.is_some()))
    })
    .await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_canvas_runs_to_completion() {
    let h = Harness::new().await;
    let gpu = h
        .add_backend(FakeBackend::succeeding("gpu-1", &["canvas_00001_.png"]))
        .await;
    let mut events = h.engine.bus.subscribe();

    let job = h
        .engine
        .jobs
        .create_job(None, linear_canvas(&h), Map::new(), None)
        .await
        .unwrap();
    let job = h.engine.jobs.run_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    let image = job.outputs["C"]["images"][0].as_str().unwrap();
    assert!(image.ends_with("canvas_00001_.png"));
    assert!(std::path::Path::new(image).starts_with(h.output_dir().join(job.id.to_string())));
    assert!(std::path::Path::new(image).exists());

    let b = job.node("B").unwrap();
    assert_eq!(b.backend_id.as_deref(), Some("gpu-1"));
    assert_eq!(b.prompt_id.as_deref(), Some("gpu-1-prompt-1"));
    assert_eq!(b.attempts, 1);

    let submitted = gpu.submitted();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0]["1"]["inputs"]["image"], json!("canvasflow/face.png"));
    assert_eq!(gpu.uploads().len(), 1);

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(seen.first().map(String::as_str), Some(job_events::JOB_STARTED));
    assert_eq!(seen.last().map(String::as_str), Some(job_events::JOB_COMPLETED));
    assert!(seen.iter().any(|e| e == job_events::NODE_PROGRESS));
}

#[tokio::test]
async fn missing_input_fails_before_dispatch() {
    let h = Harness::new().await;
    let gpu = h.add_backend(FakeBackend::succeeding("gpu-1", &["x.png"])).await;

    let canvas = CanvasLayout::new(
        vec![
            CanvasNode::new("A", NodeKind::Input)
                .with_config("file_path", json!("/nonexistent/face.png")),
            workflow("B"),
        ],
        vec![conn("A", "B", "image")],
    );
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job = h.engine.jobs.run_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("does not exist"));
    assert_eq!(job.node("A").unwrap().status, NodeStatus::Failed);
    assert_eq!(job.node("B").unwrap().status, NodeStatus::Skipped);
    assert!(gpu.submitted().is_empty());
}

#[tokio::test]
async fn inactive_condition_branch_is_pruned() {
    let h = Harness::new().await;
    let gpu = h.add_backend(FakeBackend::succeeding("gpu-1", &["x.png"])).await;

    let canvas = CanvasLayout::new(
        vec![
            input("A", &h.input_file("face.png")),
            CanvasNode::new("IF", NodeKind::Condition)
                .with_config("expression", json!("input.type == \"video\"")),
            workflow("B"),
            CanvasNode::new("C", NodeKind::Output),
            CanvasNode::new("D", NodeKind::Output),
        ],
        vec![
            conn("A", "IF", "input"),
            CanvasConnection::new("IF", "true", "B", "image"),
            conn("B", "C", "input"),
            CanvasConnection::new("IF", "false", "D", "input"),
        ],
    );
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job = h.engine.jobs.run_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.node("B").unwrap().status, NodeStatus::Skipped);
    assert_eq!(job.node("C").unwrap().status, NodeStatus::Skipped);
    assert_eq!(job.node("D").unwrap().status, NodeStatus::Completed);
    assert_eq!(job.outputs["D"]["type"], json!("image"));
    assert!(!job.outputs.contains_key("C"));
    assert!(gpu.submitted().is_empty());
}

#[tokio::test]
async fn offline_backend_fails_over() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::new("gpu-a", Behaviour::Offline)).await;
    let gpu_b = h.add_backend(FakeBackend::succeeding("gpu-b", &["out.png"])).await;
    let mut events = h.engine.bus.subscribe();

    let canvas = CanvasLayout::new(
        vec![
            workflow("B").with_backend("gpu-a"),
            CanvasNode::new("C", NodeKind::Output),
        ],
        vec![conn("B", "C", "input")],
    );
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job = h.engine.jobs.run_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    let b = job.node("B").unwrap();
    assert_eq!(b.backend_id.as_deref(), Some("gpu-b"));
    assert_eq!(b.attempts, 2);
    assert_eq!(gpu_b.submitted().len(), 1);

    let mut failover = None;
    while let Ok(event) = events.try_recv() {
        if event.event_type == job_events::NODE_FAILOVER {
            failover = Some(event);
        }
    }
    let failover = failover.expect("failover event");
    assert_eq!(failover.payload["from"], json!("gpu-a"));
    assert_eq!(failover.payload["to"], json!("gpu-b"));
}

#[tokio::test]
async fn execution_error_fails_job_with_traceback() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::new("gpu-1", Behaviour::ExecutionError)).await;

    let canvas = CanvasLayout::new(vec![workflow("B")], vec![]);
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job = h.engine.jobs.run_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let b = job.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Failed);
    assert!(b.error.as_deref().unwrap().contains("CUDA out of memory"));
    assert!(b.error_trace.as_deref().unwrap().starts_with("Traceback"));
}

#[tokio::test]
async fn no_backend_fails_the_node() {
    let h = Harness::new().await;
    let canvas = CanvasLayout::new(vec![workflow("B")], vec![]);
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job = h.engine.jobs.run_job(job.id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_deref().unwrap().contains("No backend available"), "{:?}", job.error);
}

#[tokio::test]
async fn node_timeout_fails_the_node_and_interrupts() {
    let h = Harness::with_config(|c| c.node_timeout = Duration::from_millis(200)).await;
    let gpu = h.add_backend(FakeBackend::new("gpu-1", Behaviour::Hang)).await;

    let canvas = CanvasLayout::new(
        vec![workflow("B"), CanvasNode::new("C", NodeKind::Output)],
        vec![conn("B", "C", "input")],
    );
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job = tokio::time::timeout(Duration::from_secs(5), h.engine.jobs.run_job(job.id))
        .await
        .expect("job did not settle")
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    let b = job.node("B").unwrap();
    assert_eq!(b.status, NodeStatus::Failed);
    assert!(b.error.as_deref().unwrap().contains("Timed out"), "{:?}", b.error);
    assert_eq!(b.prompt_id.as_deref(), Some("gpu-1-prompt-1"));
    assert_eq!(b.attempts, 1);
    assert_eq!(job.node("C").unwrap().status, NodeStatus::Skipped);
    assert_eq!(gpu.interrupts(), 1);
    assert_eq!(gpu.submitted().len(), 1);
}

#[tokio::test]
async fn oversized_fanout_is_rejected_at_creation() {
    let h = Harness::new().await;
    let canvas = CanvasLayout::new(
        vec![
            input("A", &h.input_file("face.png")),
            CanvasNode::new("F", NodeKind::Fanout)
                .with_config("mode", json!("round_robin"))
                .with_config("outputs", json!(i64::MAX)),
        ],
        vec![conn("A", "F", "input")],
    );
    let err = h
        .engine
        .jobs
        .create_job(None, canvas, Map::new(), None)
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::Core(CoreError::Validation(_)));
    assert!(h.engine.jobs.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn finished_jobs_are_evicted_from_memory() {
    let h = Harness::new().await;
    let canvas = CanvasLayout::new(
        vec![
            input("A", &h.input_file("face.png")),
            CanvasNode::new("C", NodeKind::Output),
        ],
        vec![conn("A", "C", "input")],
    );
    let done = h.engine.jobs.create_job(None, canvas.clone(), Map::new(), None).await.unwrap();
    h.engine.jobs.run_job(done.id).await.unwrap();
    let pending = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();

    assert_eq!(h.engine.jobs.evict_finished(Duration::from_secs(3600)).await, 0);
    assert_eq!(h.engine.jobs.evict_finished(Duration::ZERO).await, 1);

    let stored = h.engine.jobs.get_job(done.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(h.engine.jobs.run_job(done.id).await.is_err());

    let pending = h.engine.jobs.run_job(pending.id).await.unwrap();
    assert_eq!(pending.status, JobStatus::Completed);
}

#[tokio::test]
async fn pending_cancel_and_start_never_both_win() {
    let h = Harness::new().await;
    for _ in 0..25 {
        let canvas = CanvasLayout::new(
            vec![
                input("A", &h.input_file("face.png")),
                CanvasNode::new("C", NodeKind::Output),
            ],
            vec![conn("A", "C", "input")],
        );
        let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
        let (jobs_a, jobs_b) = (Arc::clone(&h.engine.jobs), Arc::clone(&h.engine.jobs));
        let run = tokio::spawn(async move { jobs_a.run_job(job.id).await });
        let cancel = tokio::spawn(async move { jobs_b.cancel_job(job.id).await });
        let (run, cancel) = (run.await.unwrap(), cancel.await.unwrap());

        let settled = h.engine.jobs.get_job(job.id).await.unwrap();
        match run {
            Ok(ran) => {
                // Started first: the cancel either stopped it or found it done.
                assert_eq!(ran.status, settled.status);
                if settled.status == JobStatus::Completed {
                    assert!(cancel.is_err() || settled.error.is_none());
                }
            }
            Err(_) => {
                cancel.unwrap();
                assert_eq!(settled.status, JobStatus::Failed);
                assert_eq!(settled.error.as_deref(), Some(CANCELLED_BY_USER));
                assert!(settled.nodes.iter().all(|n| n.status == NodeStatus::Cancelled));
            }
        }
    }
}

#[tokio::test]
async fn cancelling_a_running_job_interrupts_the_backend() {
    let h = Harness::new().await;
    let gpu = h.add_backend(FakeBackend::new("gpu-1", Behaviour::Hang)).await;

    let canvas = CanvasLayout::new(
        vec![workflow("B"), CanvasNode::new("C", NodeKind::Output)],
        vec![conn("B", "C", "input")],
    );
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job_id = job.id;
    let jobs = Arc::clone(&h.engine.jobs);
    let run = tokio::spawn(async move { jobs.run_job(job_id).await });
    wait_for_prompt(&h, job_id, "B").await;
    h.engine.jobs.cancel_job(job_id).await.unwrap();

    let job = run.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(CANCELLED_BY_USER));
    assert_eq!(job.node("B").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(job.node("C").unwrap().status, NodeStatus::Skipped);
    assert_eq!(gpu.interrupts(), 1);

    let again = h.engine.jobs.cancel_job(job.id).await;
    assert!(again.is_err());
}

#[tokio::test]
async fn cancelling_a_pending_job_settles_it() {
    let h = Harness::new().await;
    let canvas = CanvasLayout::new(vec![workflow("B")], vec![]);
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();

    let cancelled = h.engine.jobs.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.error.as_deref(), Some(CANCELLED_BY_USER));
    assert!(h.engine.jobs.run_job(job.id).await.is_err());
}

#[tokio::test]
async fn cancelling_one_node_prunes_only_its_branch() {
    let h = Harness::new().await;
    let gpu = h.add_backend(FakeBackend::new("gpu-1", Behaviour::Hang)).await;

    let canvas = CanvasLayout::new(
        vec![
            input("A", &h.input_file("face.png")),
            workflow("B"),
            CanvasNode::new("C", NodeKind::Output),
            CanvasNode::new("D", NodeKind::Output),
        ],
        vec![
            conn("A", "B", "image"),
            conn("B", "C", "input"),
            conn("A", "D", "input"),
        ],
    );
    let job = h.engine.jobs.create_job(None, canvas, Map::new(), None).await.unwrap();
    let job_id = job.id;
    let jobs = Arc::clone(&h.engine.jobs);
    let run = tokio::spawn(async move { jobs.run_job(job_id).await });
    wait_for_prompt(&h, job_id, "B").await;
    assert!(h.engine.jobs.cancel_node(job_id, "nope").await.is_err());
    h.engine.jobs.cancel_node(job_id, "B").await.unwrap();

    let job = run.await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.node("B").unwrap().status, NodeStatus::Cancelled);
    assert_eq!(job.node("C").unwrap().status, NodeStatus::Skipped);
    assert_eq!(job.node("D").unwrap().status, NodeStatus::Completed);
    assert_eq!(gpu.interrupts(), 1);
}

#[tokio::test]
async fn project_streams_run_only_marked_chains() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["s.png"])).await;

    let canvas = CanvasLayout::new(
        vec![
            input("A1", &h.input_file("one.png")),
            workflow("B1"),
            CanvasNode::new("C1", NodeKind::Output),
            CanvasNode::new("X", NodeKind::Execute),
            input("A2", &h.input_file("two.png")),
            workflow("B2"),
            CanvasNode::new("C2", NodeKind::Output),
        ],
        vec![
            conn("A1", "B1", "image"),
            conn("B1", "C1", "input"),
            conn("C1", "X", "input"),
            conn("A2", "B2", "image"),
            conn("B2", "C2", "input"),
        ],
    );
    let project = Project::new("two chains", canvas);

    let completions: Arc<Mutex<Vec<WorkflowCompletion>>> = Arc::default();
    let sink = Arc::clone(&completions);
    let callback: WorkflowCallback = Arc::new(move |c| sink.lock().unwrap().push(c));

    let jobs = h
        .engine
        .jobs
        .run_project_streams(&project, Map::new(), None, Some(callback))
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    assert_eq!(job.stream_index, Some(0));
    assert_eq!(job.project_id, Some(project.id));
    assert!(job.node("B2").is_none());
    assert_eq!(job.node("X").unwrap().status, NodeStatus::Skipped);

    let completions = completions.lock().unwrap();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].node_id, "B1");
    assert_eq!(completions[0].job_id, job.id);
    assert!(completions[0].outputs["images"][0].as_str().unwrap().ends_with("s.png"));
}
