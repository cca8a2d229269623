//! In-memory collaborators for tests.
//!
//! Enabled for this crate's own tests and, through the `testing` feature,
//! for the dev-dependencies of the other qdepth crates.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};

use crate::interfaces::{Broker, CollaboratorError, CollaboratorResult, Orchestrator, StatusSink};
use crate::types::{DeploymentRef, DeploymentState, QueueDepth, ScaleOp, StatusEvent};

/// Broker returning canned depths per job type.
pub struct FakeBroker {
    depths: Mutex<HashMap<String, QueueDepth>>,
    failing: AtomicBool,
    held: watch::Sender<bool>,
    entered: Notify,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self {
            depths: Mutex::default(),
            failing: AtomicBool::new(false),
            held: watch::Sender::new(false),
            entered: Notify::new(),
        }
    }
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every query until `release` is called.
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Wait until a query is parked by `hold`.
    pub async fn wait_for_query(&self) {
        self.entered.notified().await;
    }

    pub fn set_depth(&self, job_type: &str, ready: u64, inflight: u64) {
        self.depths
            .lock()
            .unwrap()
            .insert(job_type.to_string(), QueueDepth { ready, inflight });
    }

    /// Make every query fail until called again with `false`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Broker for FakeBroker {
    async fn queue_depth(&self, job_type: &str) -> CollaboratorResult<QueueDepth> {
        let mut held = self.held.subscribe();
        if *held.borrow_and_update() {
            self.entered.notify_one();
            let _ = held.wait_for(|held| !*held).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("broker", "connection refused"));
        }
        Ok(self
            .depths
            .lock()
            .unwrap()
            .get(job_type)
            .copied()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy)]
struct FakeDeployment {
    replicas: u32,
    available: bool,
}

/// Orchestrator keeping replica counts in memory and recording mutations.
#[derive(Default)]
pub struct FakeOrchestrator {
    deployments: Mutex<HashMap<DeploymentRef, FakeDeployment>>,
    calls: Mutex<Vec<(ScaleOp, DeploymentRef)>>,
    reads: AtomicUsize,
    failing_queries: AtomicBool,
    failing_mutations: AtomicBool,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deployment(&self, deployment: &DeploymentRef, replicas: u32, available: bool) {
        self.deployments.lock().unwrap().insert(
            deployment.clone(),
            FakeDeployment {
                replicas,
                available,
            },
        );
    }

    pub fn replicas(&self, deployment: &DeploymentRef) -> Option<u32> {
        self.deployments
            .lock()
            .unwrap()
            .get(deployment)
            .map(|d| d.replicas)
    }

    /// Every `scale_up` / `scale_down` call, in order, including failed ones.
    pub fn calls(&self) -> Vec<(ScaleOp, DeploymentRef)> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of deployment reads served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn set_failing_queries(&self, failing: bool) {
        self.failing_queries.store(failing, Ordering::SeqCst);
    }

    pub fn set_failing_mutations(&self, failing: bool) {
        self.failing_mutations.store(failing, Ordering::SeqCst);
    }

    fn lookup(&self, deployment: &DeploymentRef) -> CollaboratorResult<FakeDeployment> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.failing_queries.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("orchestrator", "api server unreachable"));
        }
        self.deployments
            .lock()
            .unwrap()
            .get(deployment)
            .copied()
            .ok_or_else(|| CollaboratorError::NotFound(deployment.to_string()))
    }

    fn mutate(&self, op: ScaleOp, deployment: &DeploymentRef) -> CollaboratorResult<()> {
        self.calls.lock().unwrap().push((op, deployment.clone()));
        if self.failing_mutations.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("orchestrator", "patch rejected"));
        }

        let mut deployments = self.deployments.lock().unwrap();
        let entry = deployments
            .get_mut(deployment)
            .ok_or_else(|| CollaboratorError::NotFound(deployment.to_string()))?;
        entry.replicas = match op {
            ScaleOp::ScaleUp => entry.replicas + 1,
            ScaleOp::ScaleDown => entry.replicas.saturating_sub(1),
        };
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn get_replicas(&self, deployment: &DeploymentRef) -> CollaboratorResult<u32> {
        self.lookup(deployment).map(|d| d.replicas)
    }

    async fn can_scale(&self, deployment: &DeploymentRef) -> CollaboratorResult<bool> {
        self.lookup(deployment).map(|d| d.available)
    }

    async fn deployment_state(&self, deployment: &DeploymentRef) -> CollaboratorResult<DeploymentState> {
        self.lookup(deployment).map(|d| DeploymentState {
            replicas: d.replicas,
            available: d.available,
        })
    }

    async fn scale_up(&self, deployment: &DeploymentRef) -> CollaboratorResult<()> {
        self.mutate(ScaleOp::ScaleUp, deployment)
    }

    async fn scale_down(&self, deployment: &DeploymentRef) -> CollaboratorResult<()> {
        self.mutate(ScaleOp::ScaleDown, deployment)
    }
}

/// Status sink that keeps every published event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<StatusEvent>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl StatusSink for RecordingSink {
    async fn publish(&self, event: StatusEvent) -> CollaboratorResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("status", "broken pipe"));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
