//! Scale executor — drains promoted operations and applies them.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use qdepth_core::{
    CollaboratorResult, DeploymentRef, Orchestrator, ScaleOp, StatusEvent, StatusSink,
    WatcherId, with_timeout,
};
use qdepth_ops::{OperationId, OperationStore, ScaleOperation, StoreError};
use qdepth_watcher::WatcherDirectory;

/// What happened to one drained operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The orchestrator accepted the change.
    Applied,
    /// The orchestrator call failed or timed out.
    Failed(String),
    /// The watcher that recorded the operation no longer exists.
    UnknownWatcher,
}

/// Per-operation result of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub operation: OperationId,
    pub op: ScaleOp,
    pub watcher: WatcherId,
    pub deployment: Option<DeploymentRef>,
    pub outcome: ExecutionOutcome,
}

/// Applies promoted operations against the orchestrator.
pub struct ScaleExecutor {
    store: OperationStore,
    orchestrator: Arc<dyn Orchestrator>,
    directory: WatcherDirectory,
    status: Arc<dyn StatusSink>,
    /// Reported in status events.
    host: String,
    call_timeout: Duration,
}

impl ScaleExecutor {
    pub fn new(
        store: OperationStore,
        orchestrator: Arc<dyn Orchestrator>,
        directory: WatcherDirectory,
        status: Arc<dyn StatusSink>,
        host: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            directory,
            status,
            host: host.into(),
            call_timeout,
        }
    }

    /// Drain the ready set once and apply every operation in it.
    pub async fn poll(&self) -> Vec<ExecutionReport> {
        let ready = self.store.ready().await;
        let mut reports = Vec::with_capacity(ready.len());

        for operation in ready {
            reports.push(self.execute(operation).await);
        }

        self.log_pending().await;
        reports
    }

    async fn execute(&self, operation: ScaleOperation) -> ExecutionReport {
        let ScaleOperation { id, data, .. } = operation;
        let op = data.op;

        let Some(info) = self.directory.lookup(&data.watcher).await else {
            warn!(
                operation = %id,
                %op,
                watcher = %data.watcher,
                "operation for unknown watcher, dropping"
            );
            self.finish(&id).await;
            return ExecutionReport {
                operation: id,
                op,
                watcher: data.watcher,
                deployment: None,
                outcome: ExecutionOutcome::UnknownWatcher,
            };
        };

        let deployment = info.deployment;
        let outcome = match self.dispatch(op, &deployment).await {
            Ok(()) => {
                info!(operation = %id, %op, %deployment, queue = %data.queue, "applied scale operation");
                self.publish(StatusEvent::scaled(op, &deployment, &self.host)).await;
                ExecutionOutcome::Applied
            }
            Err(e) => {
                error!(operation = %id, %op, %deployment, error = %e, "scale operation failed");
                ExecutionOutcome::Failed(e.to_string())
            }
        };
        self.finish(&id).await;

        ExecutionReport {
            operation: id,
            op,
            watcher: data.watcher,
            deployment: Some(deployment),
            outcome,
        }
    }

    async fn dispatch(&self, op: ScaleOp, deployment: &DeploymentRef) -> CollaboratorResult<()> {
        match op {
            ScaleOp::ScaleUp => {
                with_timeout(
                    "orchestrator",
                    self.call_timeout,
                    self.orchestrator.scale_up(deployment),
                )
                .await
            }
            ScaleOp::ScaleDown => {
                with_timeout(
                    "orchestrator",
                    self.call_timeout,
                    self.orchestrator.scale_down(deployment),
                )
                .await
            }
        }
    }

    async fn finish(&self, id: &str) {
        match self.store.finish(id).await {
            Ok(_) => {}
            // Deleted by a terminating watcher while we were applying it.
            Err(StoreError::NotFound(_)) => {
                debug!(operation = %id, "operation already removed");
            }
            Err(e) => warn!(operation = %id, error = %e, "failed to finish operation"),
        }
    }

    async fn publish(&self, event: StatusEvent) {
        let name = event.event.clone();
        if let Err(e) = with_timeout("status", self.call_timeout, self.status.publish(event)).await {
            warn!(event = %name, error = %e, "failed to publish status event");
        }
    }

    async fn log_pending(&self) {
        let pending = self.store.list().await;
        if pending.is_empty() {
            debug!("no pending operations");
            return;
        }

        for operation in &pending {
            let deployment = self
                .directory
                .lookup(&operation.data.watcher)
                .await
                .map(|info| info.deployment.to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            info!(
                operation = %operation.id,
                op = %operation.data.op,
                queue = %operation.data.queue,
                %deployment,
                watcher = %operation.data.watcher,
                age_secs = operation.created_at.elapsed().as_secs(),
                "pending operation"
            );
        }
    }

    /// Poll on `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = interval.as_secs_f64(), "scale executor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reports = self.poll().await;
                    if !reports.is_empty() {
                        debug!(executed = reports.len(), "executor poll");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scale executor shutting down");
                    break;
                }
            }
        }
    }
}
