//! End-to-end control loop tests.
//!
//! Runs the full control plane (sweeper, watchers, executor) against the
//! in-memory collaborators with tokio's clock paused.

use std::sync::Arc;
use std::time::Duration;

use qdepth_core::testing::{FakeBroker, FakeOrchestrator, RecordingSink};
use qdepth_core::{ConfigEvent, DeploymentRef, ScaleOp, Timings, WatchedDeployment};
use qdepthd::{Collaborators, ControlPlane, RunningControlPlane};

struct Harness {
    broker: Arc<FakeBroker>,
    orch: Arc<FakeOrchestrator>,
    sink: Arc<RecordingSink>,
    plane: RunningControlPlane,
}

/// Sample every 5s, sweep every 1s, poll every 7s. Sampling and polling
/// stay offset during the first cycles.
fn timings() -> Timings {
    Timings {
        sweep_interval: Duration::from_secs(1),
        poll_interval: Duration::from_secs(7),
        sample_interval: Duration::from_secs(5),
        query_timeout: Duration::from_secs(2),
        promote_after: Duration::from_secs(600),
        expire_after: Duration::from_secs(30),
    }
}

fn start() -> Harness {
    let broker = Arc::new(FakeBroker::new());
    let orch = Arc::new(FakeOrchestrator::new());
    let sink = Arc::new(RecordingSink::new());
    let plane = ControlPlane::new(
        timings(),
        Collaborators {
            broker: broker.clone(),
            orchestrator: orch.clone(),
            status: sink.clone(),
        },
        "node-a",
    )
    .start();
    Harness {
        broker,
        orch,
        sink,
        plane,
    }
}

fn svc_a(pending_time_minutes: f64) -> WatchedDeployment {
    WatchedDeployment {
        key: "svc-a:default".to_string(),
        deployment_name: "svc-a".to_string(),
        namespace: "default".to_string(),
        job_type: "convert".to_string(),
        pending_time_minutes: Some(pending_time_minutes),
    }
}

async fn sleep_secs(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[tokio::test(start_paused = true)]
async fn backlog_triggers_one_scale_up() {
    let h = start();
    let svc = DeploymentRef::new("default", "svc-a");
    h.broker.set_depth("convert", 3, 0);
    h.orch.set_deployment(&svc, 0, true);

    h.plane.events().send(ConfigEvent::Added(svc_a(0.0))).await.unwrap();

    // Watcher samples at 5s, the sweep promotes, the executor polls at 7s.
    sleep_secs(8).await;

    assert_eq!(h.orch.calls(), vec![(ScaleOp::ScaleUp, svc.clone())]);
    assert_eq!(h.orch.replicas(&svc), Some(1));
    assert!(h.plane.store().list().await.is_empty());

    let events = h.sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "scaleUp");
    assert_eq!(events[0].deployment.as_deref(), Some("svc-a"));
    assert_eq!(events[0].host, "node-a");

    h.plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sustained_backlog_waits_for_pending_time() {
    let h = start();
    let svc = DeploymentRef::new("default", "svc-a");
    // One job waiting and one in flight: only scale-up holds, and it stops
    // holding once the deployment has one replica.
    h.broker.set_depth("convert", 1, 1);
    h.orch.set_deployment(&svc, 0, true);

    h.plane.events().send(ConfigEvent::Added(svc_a(1.0))).await.unwrap();

    sleep_secs(60).await;
    assert!(h.orch.calls().is_empty());
    assert_eq!(h.plane.store().list().await.len(), 1);

    // First sighting at 5s, promotion at 65s, next poll at 70s.
    sleep_secs(11).await;
    assert_eq!(h.orch.calls(), vec![(ScaleOp::ScaleUp, svc.clone())]);

    // Stable afterwards.
    sleep_secs(120).await;
    assert_eq!(h.orch.calls().len(), 1);

    h.plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn short_lived_backlog_expires_without_scaling() {
    let h = start();
    let svc = DeploymentRef::new("default", "svc-a");
    h.broker.set_depth("convert", 1, 1);
    h.orch.set_deployment(&svc, 0, true);

    h.plane.events().send(ConfigEvent::Added(svc_a(2.0))).await.unwrap();

    sleep_secs(30).await;
    assert_eq!(h.plane.store().list().await.len(), 1);

    // Backlog drains; the intent is no longer refreshed and expires.
    h.broker.set_depth("convert", 0, 1);
    h.orch.set_deployment(&svc, 1, true);
    sleep_secs(120).await;

    assert!(h.plane.store().list().await.is_empty());
    assert!(h.orch.calls().is_empty());

    h.plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn removing_a_watcher_cleans_up_its_operations() {
    let h = start();
    let svc = DeploymentRef::new("default", "svc-a");
    h.broker.set_depth("convert", 3, 0);
    h.orch.set_deployment(&svc, 0, true);

    let events = h.plane.events();
    events.send(ConfigEvent::Added(svc_a(10.0))).await.unwrap();
    sleep_secs(6).await;
    assert_eq!(h.plane.store().list().await.len(), 1);

    events
        .send(ConfigEvent::Removed {
            key: "svc-a:default".to_string(),
        })
        .await
        .unwrap();
    while !h.plane.store().list().await.is_empty() {
        tokio::task::yield_now().await;
    }

    assert!(!h.plane.registry().is_watching("svc-a:default").await);
    sleep_secs(700).await;
    assert!(h.orch.calls().is_empty());

    h.plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_broker_never_scales() {
    let h = start();
    let svc = DeploymentRef::new("default", "svc-a");
    h.broker.set_depth("convert", 3, 0);
    h.broker.set_failing(true);
    h.orch.set_deployment(&svc, 0, true);

    h.plane.events().send(ConfigEvent::Added(svc_a(0.0))).await.unwrap();
    sleep_secs(30).await;

    assert!(h.plane.store().list().await.is_empty());
    assert!(h.orch.calls().is_empty());

    h.plane.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_all_watchers() {
    let h = start();
    h.plane.events().send(ConfigEvent::Added(svc_a(0.0))).await.unwrap();
    while !h.plane.registry().is_watching("svc-a:default").await {
        tokio::task::yield_now().await;
    }

    let registry = h.plane.registry().clone();
    h.plane.shutdown().await;
    assert!(registry.keys().await.is_empty());
}
