//! Parallel seed-variation groups against scripted backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use canvasflow_core::job_events;
use canvasflow_core::job_group::{ChildJobStatus, GroupStatus};
use canvasflow_core::seeds::SeedStrategy;
use canvasflow_events::{PlatformEvent, SinkRegistry};
use canvasflow_pipeline::parallel::GroupView;
use canvasflow_pipeline::{FileJobStore, JobGroupRequest, ParallelJobManager, PipelineError};
use common::{img2img_workflow, wait_until, Behaviour, FakeBackend, Harness};
use serde_json::{json, Map};
use tokio::sync::broadcast;
use uuid::Uuid;

fn request(backends: &[&str]) -> JobGroupRequest {
    JobGroupRequest {
        workflow: img2img_workflow(),
        backend_ids: backends.iter().map(|b| b.to_string()).collect(),
        seed_strategy: SeedStrategy::Sequential,
        base_seed: Some(100),
        parameters: Map::new(),
        metadata: Map::new(),
        timeout_secs: None,
    }
}

async fn group_completed(rx: &mut broadcast::Receiver<PlatformEvent>, group_id: Uuid) -> PlatformEvent {
    let group_id = group_id.to_string();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.event_type == job_events::GROUP_COMPLETED && event.is_about("job_group", &group_id) {
                return event;
            }
        }
    })
    .await
    .expect("group did not complete")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_child_leaves_siblings_alone() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;
    h.add_backend(FakeBackend::new("gpu-2", Behaviour::ExecutionError)).await;
    let mut events = h.engine.bus.subscribe();

    let group = h
        .engine
        .groups
        .submit_group(request(&["gpu-1", "gpu-2"]))
        .await
        .unwrap();
    let done = group_completed(&mut events, group.id).await;
    assert_eq!(done.payload["status"], json!("partial_complete"));

    let group = h.engine.groups.get_group(group.id).await.unwrap();
    assert_eq!(group.status(), GroupStatus::PartialComplete);
    assert!(group.completed_at.is_some());

    let ok = group.children.iter().find(|c| c.backend_id == "gpu-1").unwrap();
    assert_eq!(ok.status, ChildJobStatus::Completed);
    assert_eq!(ok.outputs.len(), 1);
    let expected_dir = h
        .output_dir()
        .join("groups")
        .join(group.id.to_string())
        .join(ok.id.to_string());
    assert!(std::path::Path::new(&ok.outputs[0]).starts_with(&expected_dir));

    let failed = group.children.iter().find(|c| c.backend_id == "gpu-2").unwrap();
    assert_eq!(failed.status, ChildJobStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("CUDA out of memory"));

    let view = GroupView::from(&group);
    assert_eq!((view.completed, view.failed, view.total), (1, 1, 2));
}

#[tokio::test]
async fn refused_submission_fails_only_that_child() {
    let h = Harness::new().await;
    let good = h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;
    let bad = h.add_backend(FakeBackend::new("gpu-2", Behaviour::SubmitFails)).await;
    let mut events = h.engine.bus.subscribe();

    let group = h
        .engine
        .groups
        .submit_group(request(&["gpu-1", "gpu-2"]))
        .await
        .unwrap();
    let done = group_completed(&mut events, group.id).await;
    assert_eq!(done.payload["status"], json!("partial_complete"));

    let group = h.engine.groups.get_group(group.id).await.unwrap();
    assert_eq!(group.status(), GroupStatus::PartialComplete);
    let failed = group.children.iter().find(|c| c.backend_id == "gpu-2").unwrap();
    assert_eq!(failed.status, ChildJobStatus::Failed);
    assert!(failed.error.as_deref().unwrap().contains("offline"), "{:?}", failed.error);
    assert!(failed.prompt_id.is_none());
    let ok = group.children.iter().find(|c| c.backend_id == "gpu-1").unwrap();
    assert_eq!(ok.status, ChildJobStatus::Completed);

    // Group children stay on their own backend.
    assert_eq!(good.submitted().len(), 1);
    assert!(bad.submitted().is_empty());
}

#[tokio::test]
async fn group_fails_when_every_submission_is_refused() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::new("gpu-1", Behaviour::SubmitFails)).await;
    h.add_backend(FakeBackend::new("gpu-2", Behaviour::SubmitFails)).await;
    let mut events = h.engine.bus.subscribe();

    let group = h
        .engine
        .groups
        .submit_group(request(&["gpu-1", "gpu-2"]))
        .await
        .unwrap();
    group_completed(&mut events, group.id).await;
    let group = h.engine.groups.get_group(group.id).await.unwrap();
    assert_eq!(group.status(), GroupStatus::Failed);
}

#[tokio::test]
async fn sequential_seeds_are_patched_per_child() {
    let h = Harness::new().await;
    let gpus = [
        h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await,
        h.add_backend(FakeBackend::succeeding("gpu-2", &["b.png"])).await,
        h.add_backend(FakeBackend::succeeding("gpu-3", &["c.png"])).await,
    ];
    let mut events = h.engine.bus.subscribe();

    let group = h
        .engine
        .groups
        .submit_group(request(&["gpu-1", "gpu-2", "gpu-3"]))
        .await
        .unwrap();
    let seeds: Vec<u64> = group.children.iter().map(|c| c.seed).collect();
    assert_eq!(seeds, vec![100, 101, 102]);

    group_completed(&mut events, group.id).await;
    for (gpu, seed) in gpus.iter().zip(seeds) {
        let submitted = gpu.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0]["3"]["inputs"]["seed"], json!(seed));
        assert_eq!(submitted[0]["4"]["inputs"]["ckpt_name"], json!("sdxl.safetensors"));
    }
    let group = h.engine.groups.get_group(group.id).await.unwrap();
    assert_eq!(group.status(), GroupStatus::Completed);
}

#[tokio::test]
async fn shared_seed_parameter_keeps_child_seeds() {
    let h = Harness::new().await;
    let gpus = [
        h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await,
        h.add_backend(FakeBackend::succeeding("gpu-2", &["b.png"])).await,
    ];
    let mut events = h.engine.bus.subscribe();

    let mut req = request(&["gpu-1", "gpu-2"]);
    req.parameters.insert("seed".to_string(), json!(7));
    req.parameters.insert("3.noise_seed".to_string(), json!(7));
    let group = h.engine.groups.submit_group(req).await.unwrap();
    group_completed(&mut events, group.id).await;

    for (gpu, child) in gpus.iter().zip(&group.children) {
        let submitted = &gpu.submitted()[0];
        assert_eq!(submitted["3"]["inputs"]["seed"], json!(child.seed));
        assert_eq!(submitted["3"]["inputs"]["noise_seed"], json!(child.seed));
    }
    assert_eq!(
        group.children.iter().map(|c| c.seed).collect::<Vec<_>>(),
        vec![100, 101]
    );
}

#[tokio::test]
async fn group_parameters_are_patched() {
    let h = Harness::new().await;
    let gpu = h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;
    let mut events = h.engine.bus.subscribe();

    let mut req = request(&["gpu-1"]);
    req.parameters.insert("steps".to_string(), json!(35));
    let group = h.engine.groups.submit_group(req).await.unwrap();
    group_completed(&mut events, group.id).await;

    assert_eq!(gpu.submitted()[0]["3"]["inputs"]["steps"], json!(35));
}

#[tokio::test]
async fn unknown_backends_are_dropped() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;

    let group = h
        .engine
        .groups
        .submit_group(request(&["gpu-1", "ghost", "gpu-1"]))
        .await
        .unwrap();
    assert_eq!(group.children.len(), 1);
    assert_eq!(group.children[0].backend_id, "gpu-1");

    let err = h
        .engine
        .groups
        .submit_group(request(&["ghost", "phantom"]))
        .await
        .unwrap_err();
    assert_matches!(err, PipelineError::NoBackendAvailable(_));
}

#[tokio::test]
async fn invalid_workflow_is_rejected() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;

    let mut req = request(&["gpu-1"]);
    req.workflow = json!({"1": {"inputs": {}}});
    let err = h.engine.groups.submit_group(req).await.unwrap_err();
    assert_matches!(err, PipelineError::Core(_));
}

#[tokio::test]
async fn cancelling_a_group_interrupts_running_children() {
    let h = Harness::new().await;
    let gpus = [
        h.add_backend(FakeBackend::new("gpu-1", Behaviour::Hang)).await,
        h.add_backend(FakeBackend::new("gpu-2", Behaviour::Hang)).await,
    ];
    let mut events = h.engine.bus.subscribe();

    let group = h
        .engine
        .groups
        .submit_group(request(&["gpu-1", "gpu-2"]))
        .await
        .unwrap();
    let groups = &h.engine.groups;
    let group_id = group.id;
    wait_until(move || async move {
        groups
            .get_group(group_id)
            .await
            .is_ok_and(|g| g.children.iter().all(|c| c.prompt_id.is_some()))
    })
    .await;

    let response = h.engine.groups.cancel_group(group_id).await.unwrap();
    assert_eq!(response.interrupted, 2);
    assert_eq!(response.already_complete, 0);

    group_completed(&mut events, group_id).await;
    let group = h.engine.groups.get_group(group_id).await.unwrap();
    assert_eq!(group.status(), GroupStatus::Cancelled);
    assert!(group
        .children
        .iter()
        .all(|c| c.status == ChildJobStatus::Cancelled));
    for gpu in &gpus {
        assert_eq!(gpu.interrupts(), 1);
    }

    let again = h.engine.groups.cancel_group(group_id).await.unwrap();
    assert_eq!(again.interrupted, 0);
    assert_eq!(again.already_complete, 2);
}

#[tokio::test]
async fn cancelling_a_finished_group_keeps_its_status() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;
    let mut events = h.engine.bus.subscribe();

    let group = h.engine.groups.submit_group(request(&["gpu-1"])).await.unwrap();
    group_completed(&mut events, group.id).await;

    let response = h.engine.groups.cancel_group(group.id).await.unwrap();
    assert_eq!((response.interrupted, response.already_complete), (0, 1));

    let group = h.engine.groups.get_group(group.id).await.unwrap();
    assert_eq!(group.status(), GroupStatus::Completed);
    assert!(!group.cancelled);
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.event_type, job_events::GROUP_CANCELLED);
    }
}

#[tokio::test]
async fn finished_groups_are_evicted_from_memory() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;
    h.add_backend(FakeBackend::new("gpu-2", Behaviour::Hang)).await;
    let mut events = h.engine.bus.subscribe();

    let done = h.engine.groups.submit_group(request(&["gpu-1"])).await.unwrap();
    group_completed(&mut events, done.id).await;
    let running = h.engine.groups.submit_group(request(&["gpu-2"])).await.unwrap();

    assert_eq!(h.engine.groups.evict_finished(Duration::from_secs(3600)).await, 0);
    assert_eq!(h.engine.groups.evict_finished(Duration::ZERO).await, 1);
    assert_eq!(h.engine.groups.evict_finished(Duration::ZERO).await, 0);

    let stored = h.engine.groups.get_group(done.id).await.unwrap();
    assert_eq!(stored.status(), GroupStatus::Completed);
    let cancel = h.engine.groups.cancel_group(done.id).await.unwrap();
    assert_eq!((cancel.interrupted, cancel.already_complete), (0, 1));

    let live = h.engine.groups.cancel_group(running.id).await.unwrap();
    assert_eq!(live.interrupted, 1);
}

#[tokio::test]
async fn slow_child_times_out_and_sink_closes() {
    let h = Harness::new().await;
    let gpu = h.add_backend(FakeBackend::new("gpu-1", Behaviour::Hang)).await;

    let mut req = request(&["gpu-1"]);
    req.timeout_secs = Some(1);
    let group = h.engine.groups.submit_group(req).await.unwrap();
    let (_sink, mut rx) = h.engine.sinks.register(&group.id.to_string()).await;

    let mut seen = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("sink stalled")
    {
        seen.push(event.event_type);
    }
    assert!(seen.iter().any(|e| e == job_events::CHILD_TIMEOUT));
    assert_eq!(seen.last().map(String::as_str), Some(job_events::GROUP_COMPLETED));

    let group = h.engine.groups.get_group(group.id).await.unwrap();
    assert_eq!(group.children[0].status, ChildJobStatus::Timeout);
    assert_eq!(group.status(), GroupStatus::Failed);
    assert_eq!(gpu.interrupts(), 1);
}

#[tokio::test]
async fn finished_groups_are_served_from_the_store() {
    let h = Harness::new().await;
    h.add_backend(FakeBackend::succeeding("gpu-1", &["a.png"])).await;
    let store = Arc::new(FileJobStore::open(h.dir.path().join("state")).await.unwrap());
    let manager = Arc::new(ParallelJobManager::new(
        Arc::clone(&h.engine.registry),
        store.clone(),
        Arc::clone(&h.engine.bus),
        Arc::new(SinkRegistry::new()),
        h.output_dir(),
    ));
    let mut events = h.engine.bus.subscribe();

    let group = manager.submit_group(request(&["gpu-1"])).await.unwrap();
    group_completed(&mut events, group.id).await;

    // A fresh manager over the same directory sees only the stored state.
    let restarted = ParallelJobManager::new(
        Arc::clone(&h.engine.registry),
        store,
        Arc::clone(&h.engine.bus),
        Arc::new(SinkRegistry::new()),
        h.output_dir(),
    );
    let stored = restarted.get_group(group.id).await.unwrap();
    assert_eq!(stored.status(), GroupStatus::Completed);
    assert_eq!(stored.children[0].seed, 100);
    assert_eq!(restarted.list_groups().await.unwrap().len(), 1);

    let cancel = restarted.cancel_group(group.id).await.unwrap();
    assert_eq!((cancel.interrupted, cancel.already_complete), (0, 1));

    assert_matches!(
        restarted.get_group(Uuid::new_v4()).await,
        Err(PipelineError::Core(_))
    );
}
