//! Deployment watcher — samples one queue and records scale intents.
//!
//! Each tick reads the queue depth from the broker and the replica state
//! from the orchestrator, evaluates the scaling conditions, and calls
//! `OperationStore::create()` for every condition that holds. Calling
//! `create()` again on the next tick is what keeps an intent alive; when
//! a condition stops holding the intent simply expires in the store.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use qdepth_core::{
    Broker, CollaboratorError, DeploymentRef, Orchestrator, ScaleOp, WatchedDeployment, WatcherId,
    with_timeout,
};
use qdepth_ops::{OperationData, OperationId, OperationStore, StoreError};

/// One observation of a deployment and its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthSample {
    /// Jobs waiting to be claimed.
    pub ready: u64,
    /// Jobs being processed.
    pub inflight: u64,
    /// Current desired replica count.
    pub replicas: u32,
    /// Whether the deployment may be scaled right now.
    pub can_scale: bool,
}

/// Scale conditions that held for a sample. Both may hold at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScaleIntents {
    pub scale_up: bool,
    pub scale_down: bool,
}

impl ScaleIntents {
    pub fn ops(&self) -> Vec<ScaleOp> {
        let mut ops = Vec::with_capacity(2);
        if self.scale_up {
            ops.push(ScaleOp::ScaleUp);
        }
        if self.scale_down {
            ops.push(ScaleOp::ScaleDown);
        }
        ops
    }
}

/// Evaluate the scaling conditions for a sample.
///
/// Scale up while there is backlog, the deployment is available, and the
/// replica count does not already match the backlog. Scale down while
/// there are more replicas than jobs in flight.
pub fn evaluate(sample: &DepthSample) -> ScaleIntents {
    let replicas = u64::from(sample.replicas);
    ScaleIntents {
        scale_up: sample.ready > 0 && sample.can_scale && replicas != sample.ready,
        scale_down: replicas > sample.inflight,
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A collaborator query failed; nothing was recorded.
    Skipped,
    /// The watcher was cancelled while the tick was in flight.
    Cancelled,
    Evaluated {
        sample: DepthSample,
        intents: ScaleIntents,
        /// Ids returned by the store, new or refreshed.
        operations: Vec<OperationId>,
    },
}

/// Watches one deployment.
pub struct Watcher {
    id: WatcherId,
    job_type: String,
    deployment: DeploymentRef,
    pending_time: Duration,
    query_timeout: Duration,
    store: OperationStore,
    broker: Arc<dyn Broker>,
    orchestrator: Arc<dyn Orchestrator>,
    /// Operations created by this watcher that may still be in the store.
    tracked: BTreeSet<OperationId>,
}

impl Watcher {
    pub fn new(
        spec: &WatchedDeployment,
        pending_time: Duration,
        query_timeout: Duration,
        store: OperationStore,
        broker: Arc<dyn Broker>,
        orchestrator: Arc<dyn Orchestrator>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: spec.job_type.clone(),
            deployment: spec.deployment(),
            pending_time,
            query_timeout,
            store,
            broker,
            orchestrator,
            tracked: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn deployment(&self) -> &DeploymentRef {
        &self.deployment
    }

    pub fn pending_time(&self) -> Duration {
        self.pending_time
    }

    pub fn tracked(&self) -> impl Iterator<Item = &OperationId> {
        self.tracked.iter()
    }

    /// Query the broker and orchestrator for the current state.
    pub async fn sample(&self) -> Result<DepthSample, CollaboratorError> {
        let depth = with_timeout(
            "broker",
            self.query_timeout,
            self.broker.queue_depth(&self.job_type),
        )
        .await?;

        if depth.ready != 0 {
            debug!(job_type = %self.job_type, ready = depth.ready, "exchange has ready messages");
        }
        if depth.inflight != 0 {
            debug!(job_type = %self.job_type, unacked = depth.inflight, "exchange has unacked messages");
        }

        let state = with_timeout(
            "orchestrator",
            self.query_timeout,
            self.orchestrator.deployment_state(&self.deployment),
        )
        .await?;

        Ok(DepthSample {
            ready: depth.ready,
            inflight: depth.inflight,
            replicas: state.replicas,
            can_scale: state.available,
        })
    }

    /// Run one sampling tick.
    ///
    /// `cancel` is checked after the collaborator calls return; a watcher
    /// terminated mid-tick records nothing.
    pub async fn tick(&mut self, cancel: &watch::Receiver<bool>) -> TickOutcome {
        let sample = match self.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(
                    watcher = %self.id,
                    deployment = %self.deployment,
                    job_type = %self.job_type,
                    error = %e,
                    "queue sample failed, skipping tick"
                );
                return TickOutcome::Skipped;
            }
        };

        if *cancel.borrow() {
            debug!(watcher = %self.id, "watcher cancelled mid-tick, discarding sample");
            return TickOutcome::Cancelled;
        }

        let intents = evaluate(&sample);
        debug!(
            watcher = %self.id,
            deployment = %self.deployment,
            ready = sample.ready,
            inflight = sample.inflight,
            replicas = sample.replicas,
            can_scale = sample.can_scale,
            scale_up = intents.scale_up,
            scale_down = intents.scale_down,
            "evaluated sample"
        );

        if sample.ready > 0 && sample.can_scale && !intents.scale_up {
            warn!(
                deployment = %self.deployment,
                replicas = sample.replicas,
                ready = sample.ready,
                "want to scale up, but already at replica/backlog limit"
            );
        }

        let mut operations = Vec::new();
        for op in intents.ops() {
            let data = OperationData::new(self.id.clone(), op, self.job_type.clone());
            match self.store.create(data, Some(self.pending_time), None).await {
                Ok(created) => {
                    self.tracked.insert(created.id.clone());
                    operations.push(created.id);
                }
                Err(e) => {
                    error!(watcher = %self.id, %op, error = %e, "failed to record scale intent");
                }
            }
        }

        self.gc().await;

        TickOutcome::Evaluated {
            sample,
            intents,
            operations,
        }
    }

    /// Forget tracked operations that were executed or expired.
    async fn gc(&mut self) {
        let mut gone = Vec::new();
        for id in &self.tracked {
            if !self.store.contains(id).await {
                gone.push(id.clone());
            }
        }
        for id in gone {
            self.tracked.remove(&id);
        }
    }

    /// Sample on `interval` until `shutdown` flips, then hand the watcher
    /// back so the caller can terminate it.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> Self {
        let cancel = shutdown.clone();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(
            watcher = %self.id,
            deployment = %self.deployment,
            job_type = %self.job_type,
            "watcher loop starting"
        );

        loop {
            if *cancel.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(&cancel).await;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        debug!(watcher = %self.id, "watcher loop stopped");
        self
    }

    /// Delete every tracked operation still in the store. Returns how many
    /// were removed.
    pub async fn terminate(self) -> usize {
        let mut removed = 0;
        for id in &self.tracked {
            match self.store.delete(id).await {
                Ok(_) => removed += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    warn!(watcher = %self.id, operation = %id, error = %e, "failed to clean up live operation");
                }
            }
        }

        info!(
            watcher = %self.id,
            deployment = %self.deployment,
            removed,
            "watcher terminated"
        );
        removed
    }
}
