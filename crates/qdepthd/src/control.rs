//! Control plane wiring: store, sweeper, watcher registry, executor.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use qdepth_core::{Broker, ConfigEvent, Orchestrator, StatusSink, Timings};
use qdepth_executor::ScaleExecutor;
use qdepth_ops::{OperationDefaults, OperationStore};
use qdepth_watcher::{WatcherRegistry, WatcherSettings};

/// Capacity of the config event channel.
const EVENT_BUFFER: usize = 64;

/// The external systems the control loop talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub broker: Arc<dyn Broker>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub status: Arc<dyn StatusSink>,
}

/// Everything needed to run the control loop, not yet started.
pub struct ControlPlane {
    timings: Timings,
    store: OperationStore,
    registry: Arc<WatcherRegistry>,
    executor: Arc<ScaleExecutor>,
}

impl ControlPlane {
    pub fn new(timings: Timings, collaborators: Collaborators, host: impl Into<String>) -> Self {
        let store = OperationStore::new(OperationDefaults {
            promote_after: timings.promote_after,
            expire_after: timings.expire_after,
        });

        let registry = Arc::new(WatcherRegistry::new(
            store.clone(),
            collaborators.broker,
            collaborators.orchestrator.clone(),
            WatcherSettings {
                sample_interval: timings.sample_interval,
                query_timeout: timings.query_timeout,
                default_pending_time: timings.promote_after,
            },
        ));

        let executor = Arc::new(ScaleExecutor::new(
            store.clone(),
            collaborators.orchestrator,
            registry.directory(),
            collaborators.status,
            host,
            timings.query_timeout,
        ));

        Self {
            timings,
            store,
            registry,
            executor,
        }
    }

    /// Spawn the sweeper, the executor and the registry event loop.
    pub fn start(self) -> RunningControlPlane {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let mut handles = Vec::new();

        let store = self.store.clone();
        let sweep_interval = self.timings.sweep_interval;
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            store.run_sweeper(sweep_interval, shutdown).await;
        }));

        let executor = self.executor.clone();
        let poll_interval = self.timings.poll_interval;
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            executor.run(poll_interval, shutdown).await;
        }));

        let registry = self.registry.clone();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            registry.run(events_rx, shutdown).await;
        }));

        info!(
            sweep_ms = self.timings.sweep_interval.as_millis() as u64,
            poll_ms = self.timings.poll_interval.as_millis() as u64,
            sample_ms = self.timings.sample_interval.as_millis() as u64,
            "control plane started"
        );

        RunningControlPlane {
            store: self.store,
            registry: self.registry,
            events: events_tx,
            shutdown_tx,
            shutdown_rx,
            handles,
        }
    }
}

/// A started control plane.
pub struct RunningControlPlane {
    store: OperationStore,
    registry: Arc<WatcherRegistry>,
    events: mpsc::Sender<ConfigEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl RunningControlPlane {
    /// Sender for watcher definitions.
    pub fn events(&self) -> mpsc::Sender<ConfigEvent> {
        self.events.clone()
    }

    /// Flips to `true` when the control plane shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn store(&self) -> &OperationStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WatcherRegistry> {
        &self.registry
    }

    /// Stop every loop and wait for them; watchers are terminated.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("control plane stopped");
    }
}
