//! OperationStore — in-memory pending scale operations with dedup and TTL.
//!
//! Operations are indexed by id and, while pending, by content
//! fingerprint. A periodic sweep expires operations that have not been
//! re-affirmed within `expire_after` and promotes operations older than
//! `promote_after` into the ready set, where the executor picks them up.
//!
//! Promoted operations leave the fingerprint index, so they are neither
//! expired nor refreshed again; a new `create()` with the same data starts
//! a fresh operation. They stay addressable by id until finished.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};
use crate::types::{OperationData, OperationId, ScaleOperation};

/// Default timings applied when `create()` gets no overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationDefaults {
    pub promote_after: Duration,
    pub expire_after: Duration,
}

impl Default for OperationDefaults {
    fn default() -> Self {
        Self {
            promote_after: Duration::from_secs(10 * 60),
            expire_after: Duration::from_secs(60),
        }
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub promoted: usize,
}

#[derive(Default)]
struct Tables {
    /// Every live operation, pending or promoted.
    operations: HashMap<OperationId, ScaleOperation>,
    /// fingerprint → id, pending operations only.
    fingerprints: HashMap<String, OperationId>,
    /// Promoted ids not yet handed out by `ready()`, in promotion order.
    ready: Vec<OperationId>,
}

impl Tables {
    fn remove(&mut self, id: &str) -> Option<ScaleOperation> {
        let op = self.operations.remove(id)?;
        if self.fingerprints.get(&op.fingerprint).is_some_and(|owner| owner == id) {
            self.fingerprints.remove(&op.fingerprint);
        }
        Some(op)
    }
}

/// Shared handle to the operation store. Cloning is cheap; all clones see
/// the same operations.
#[derive(Clone)]
pub struct OperationStore {
    tables: Arc<Mutex<Tables>>,
    defaults: OperationDefaults,
}

impl Default for OperationStore {
    fn default() -> Self {
        Self::new(OperationDefaults::default())
    }
}

impl OperationStore {
    pub fn new(defaults: OperationDefaults) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            defaults,
        }
    }

    pub fn defaults(&self) -> OperationDefaults {
        self.defaults
    }

    /// Create an operation, or refresh the pending one with the same data.
    ///
    /// A refresh only moves `updated_at`; the original `created_at` and
    /// timings are kept, so promotion is still measured from first sighting.
    pub async fn create(
        &self,
        data: OperationData,
        promote_after: Option<Duration>,
        expire_after: Option<Duration>,
    ) -> StoreResult<ScaleOperation> {
        if data.watcher.trim().is_empty() {
            return Err(StoreError::InvalidOperation("watcher id is empty".to_string()));
        }
        if data.queue.trim().is_empty() {
            return Err(StoreError::InvalidOperation("queue is empty".to_string()));
        }

        let fingerprint = data.fingerprint();
        let now = Instant::now();
        let mut tables = self.tables.lock().await;

        if let Some(id) = tables.fingerprints.get(&fingerprint).cloned()
            && let Some(existing) = tables.operations.get_mut(&id)
        {
            existing.updated_at = now;
            debug!(operation = %id, op = %existing.data.op, watcher = %existing.data.watcher, "refreshed pending operation");
            return Ok(existing.clone());
        }

        let op = ScaleOperation {
            id: uuid::Uuid::new_v4().to_string(),
            data,
            fingerprint: fingerprint.clone(),
            created_at: now,
            updated_at: now,
            promote_after: promote_after.unwrap_or(self.defaults.promote_after),
            expire_after: expire_after.unwrap_or(self.defaults.expire_after),
            promoted: false,
        };

        debug!(
            operation = %op.id,
            op = %op.data.op,
            watcher = %op.data.watcher,
            promote_after_secs = op.promote_after.as_secs_f64(),
            "created pending operation"
        );

        tables.fingerprints.insert(fingerprint, op.id.clone());
        tables.operations.insert(op.id.clone(), op.clone());
        Ok(op)
    }

    /// Id of the pending operation with this data, if any.
    pub async fn exists(&self, data: &OperationData) -> Option<OperationId> {
        let tables = self.tables.lock().await;
        tables.fingerprints.get(&data.fingerprint()).cloned()
    }

    /// Copy of an operation by id.
    pub async fn get(&self, id: &str) -> StoreResult<ScaleOperation> {
        let tables = self.tables.lock().await;
        tables
            .operations
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Whether an operation with this id is still live.
    pub async fn contains(&self, id: &str) -> bool {
        self.tables.lock().await.operations.contains_key(id)
    }

    /// Remove an operation from every index.
    pub async fn delete(&self, id: &str) -> StoreResult<ScaleOperation> {
        let mut tables = self.tables.lock().await;
        let op = tables
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        debug!(operation = %id, op = %op.data.op, promoted = op.promoted, "deleted operation");
        Ok(op)
    }

    /// Mark an operation as executed.
    pub async fn finish(&self, id: &str) -> StoreResult<ScaleOperation> {
        self.delete(id).await
    }

    /// Snapshot of all pending (unpromoted) operations, oldest first.
    pub async fn list(&self) -> Vec<ScaleOperation> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<ScaleOperation> = tables
            .operations
            .values()
            .filter(|op| !op.promoted)
            .cloned()
            .collect();
        pending.sort_by_key(|op| op.created_at);
        pending
    }

    /// Drain the ready set.
    ///
    /// Each promoted operation is returned by exactly one call. Operations
    /// deleted after promotion are skipped. Callers must not run two drains
    /// concurrently if they rely on ordering between them.
    pub async fn ready(&self) -> Vec<ScaleOperation> {
        let mut tables = self.tables.lock().await;
        let ids = std::mem::take(&mut tables.ready);
        ids.iter()
            .filter_map(|id| tables.operations.get(id).cloned())
            .collect()
    }

    /// One expiry/promotion pass over the pending operations.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let mut tables = self.tables.lock().await;
        let mut report = SweepReport::default();

        let mut expired = Vec::new();
        let mut due = Vec::new();
        for op in tables.operations.values().filter(|op| !op.promoted) {
            if op.is_expired(now) {
                expired.push(op.id.clone());
            } else if op.is_due(now) {
                due.push((op.created_at, op.id.clone()));
            }
        }

        for id in expired {
            if let Some(op) = tables.remove(&id) {
                info!(operation = %id, op = %op.data.op, watcher = %op.data.watcher, queue = %op.data.queue, "expiring operation");
                report.expired += 1;
            }
        }

        due.sort();
        for (_, id) in due {
            let Some(op) = tables.operations.get_mut(&id) else {
                continue;
            };
            op.promoted = true;
            let fingerprint = op.fingerprint.clone();
            info!(operation = %id, op = %op.data.op, watcher = %op.data.watcher, "promoting operation");

            if tables.fingerprints.get(&fingerprint).is_some_and(|owner| *owner == id) {
                tables.fingerprints.remove(&fingerprint);
            }
            tables.ready.push(id);
            report.promoted += 1;
        }

        report
    }

    /// Start a background sweep on a fixed interval.
    pub fn start_sweep(&self, interval: Duration) -> SweepHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let store = self.clone();
        let handle = tokio::spawn(async move {
            store.run_sweeper(interval, shutdown_rx).await;
        });
        SweepHandle {
            handle,
            shutdown_tx,
        }
    }

    /// Run the sweep loop until `shutdown` flips.
    ///
    /// Passes run back to back inside one task, so a slow pass delays the
    /// next tick instead of overlapping it.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        debug!(interval_ms = interval.as_millis() as u64, "operation sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if report != SweepReport::default() {
                        debug!(expired = report.expired, promoted = report.promoted, "sweep pass");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("operation sweeper shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle to a sweep started with [`OperationStore::start_sweep`].
pub struct SweepHandle {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

impl SweepHandle {
    /// Stop the sweep and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}
