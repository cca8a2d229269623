//! Watcher registry — owns every running watcher.
//!
//! Watchers are created and destroyed only here, in response to config
//! events. Each one runs as a background task with its own shutdown
//! signal; removing it waits for the in-flight tick, then deletes the
//! operations it left in the store.
//!
//! The registry also keeps a [`WatcherDirectory`] (watcher id →
//! deployment) that the executor uses to resolve operations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use qdepth_core::{
    Broker, ConfigEvent, DeploymentRef, Orchestrator, WatchKey, WatchedDeployment, WatcherId,
};
use qdepth_ops::OperationStore;

use crate::error::{RegistryError, RegistryResult};
use crate::watcher::Watcher;

/// Timing shared by every watcher the registry starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatcherSettings {
    pub sample_interval: Duration,
    pub query_timeout: Duration,
    /// Debounce used when a spec does not set one.
    pub default_pending_time: Duration,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_secs(5),
            query_timeout: Duration::from_secs(10),
            default_pending_time: Duration::from_secs(10 * 60),
        }
    }
}

/// What a running watcher targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherInfo {
    pub key: WatchKey,
    pub deployment: DeploymentRef,
    pub job_type: String,
}

/// Read-only view of live watchers, keyed by watcher id.
#[derive(Clone, Default)]
pub struct WatcherDirectory {
    inner: Arc<RwLock<HashMap<WatcherId, WatcherInfo>>>,
}

impl WatcherDirectory {
    pub async fn lookup(&self, watcher: &str) -> Option<WatcherInfo> {
        self.inner.read().await.get(watcher).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn insert(&self, watcher: WatcherId, info: WatcherInfo) {
        self.inner.write().await.insert(watcher, info);
    }

    async fn remove(&self, watcher: &str) {
        self.inner.write().await.remove(watcher);
    }
}

/// Result of [`WatcherRegistry::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Started(WatcherId),
    /// The key was already registered with an identical definition.
    Unchanged(WatcherId),
    /// The key was registered with a different definition; the old watcher
    /// was terminated and a new one started.
    Replaced(WatcherId),
}

/// A running watcher task.
struct WatcherSlot {
    id: WatcherId,
    spec: WatchedDeployment,
    handle: JoinHandle<Watcher>,
    shutdown_tx: watch::Sender<bool>,
}

/// Owns the lifetime of every watcher.
pub struct WatcherRegistry {
    store: OperationStore,
    broker: Arc<dyn Broker>,
    orchestrator: Arc<dyn Orchestrator>,
    settings: WatcherSettings,
    /// Active watchers: external key → slot.
    slots: Mutex<HashMap<WatchKey, WatcherSlot>>,
    directory: WatcherDirectory,
}

impl WatcherRegistry {
    pub fn new(
        store: OperationStore,
        broker: Arc<dyn Broker>,
        orchestrator: Arc<dyn Orchestrator>,
        settings: WatcherSettings,
    ) -> Self {
        Self {
            store,
            broker,
            orchestrator,
            settings,
            slots: Mutex::new(HashMap::new()),
            directory: WatcherDirectory::default(),
        }
    }

    pub fn directory(&self) -> WatcherDirectory {
        self.directory.clone()
    }

    /// Validate a spec and return its debounce time.
    fn pending_time(&self, spec: &WatchedDeployment) -> RegistryResult<Duration> {
        let invalid = |reason: &str| RegistryError::InvalidSpec {
            key: spec.key.clone(),
            reason: reason.to_string(),
        };

        if spec.key.trim().is_empty() {
            return Err(invalid("key is empty"));
        }
        if spec.deployment_name.trim().is_empty() {
            return Err(invalid("deploymentName is empty"));
        }
        if spec.job_type.trim().is_empty() {
            return Err(invalid("jobType is empty"));
        }
        if spec.namespace.trim().is_empty() {
            return Err(invalid("namespace is empty"));
        }

        match spec.pending_time_minutes {
            None => Ok(self.settings.default_pending_time),
            Some(minutes) => Duration::try_from_secs_f64(minutes * 60.0)
                .map_err(|_| invalid("pendingTimeMinutes must be a non-negative number")),
        }
    }

    /// Start watching a deployment.
    pub async fn add(&self, spec: WatchedDeployment) -> RegistryResult<AddOutcome> {
        let pending_time = self.pending_time(&spec)?;
        let deployment = spec.deployment();

        let mut slots = self.slots.lock().await;

        if let Some((existing, _)) = slots
            .iter()
            .find(|(key, slot)| **key != spec.key && slot.spec.deployment() == deployment)
        {
            return Err(RegistryError::DuplicateDeployment {
                deployment: deployment.to_string(),
                existing: existing.clone(),
            });
        }

        let replaced = match slots.remove(&spec.key) {
            Some(slot) if slot.spec == spec => {
                let id = slot.id.clone();
                slots.insert(spec.key.clone(), slot);
                debug!(key = %spec.key, watcher = %id, "watcher definition unchanged");
                return Ok(AddOutcome::Unchanged(id));
            }
            Some(slot) => {
                info!(key = %spec.key, watcher = %slot.id, "watcher definition changed, replacing");
                self.shutdown_slot(slot).await;
                true
            }
            None => false,
        };

        let watcher = Watcher::new(
            &spec,
            pending_time,
            self.settings.query_timeout,
            self.store.clone(),
            self.broker.clone(),
            self.orchestrator.clone(),
        );
        let id = watcher.id().to_string();

        self.directory
            .insert(
                id.clone(),
                WatcherInfo {
                    key: spec.key.clone(),
                    deployment: deployment.clone(),
                    job_type: spec.job_type.clone(),
                },
            )
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(watcher.run(self.settings.sample_interval, shutdown_rx));

        info!(
            key = %spec.key,
            watcher = %id,
            %deployment,
            job_type = %spec.job_type,
            pending_time_secs = pending_time.as_secs_f64(),
            "watcher started"
        );

        slots.insert(
            spec.key.clone(),
            WatcherSlot {
                id: id.clone(),
                spec,
                handle,
                shutdown_tx,
            },
        );

        Ok(if replaced {
            AddOutcome::Replaced(id)
        } else {
            AddOutcome::Started(id)
        })
    }

    /// Stop watching. Returns how many pending operations were cleaned up.
    ///
    /// The key is unregistered before the watcher finishes its current tick;
    /// cleanup runs without holding the slot table.
    pub async fn remove(&self, key: &str) -> RegistryResult<usize> {
        let slot = self
            .slots
            .lock()
            .await
            .remove(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        Ok(self.shutdown_slot(slot).await)
    }

    /// Stop a watcher task, wait for its current tick, and clean up.
    async fn shutdown_slot(&self, slot: WatcherSlot) -> usize {
        let _ = slot.shutdown_tx.send(true);
        self.directory.remove(&slot.id).await;

        match slot.handle.await {
            Ok(watcher) => watcher.terminate().await,
            Err(e) => {
                error!(key = %slot.spec.key, watcher = %slot.id, error = %e, "watcher task failed");
                0
            }
        }
    }

    /// Apply a config event, logging instead of failing.
    pub async fn handle(&self, event: ConfigEvent) {
        match event {
            ConfigEvent::Added(spec) => {
                let key = spec.key.clone();
                match self.add(spec).await {
                    Ok(outcome) => debug!(%key, ?outcome, "applied watcher add"),
                    Err(e) => warn!(%key, error = %e, "skipping watcher definition"),
                }
            }
            ConfigEvent::Removed { key } => match self.remove(&key).await {
                Ok(removed) => info!(%key, removed, "watcher removed"),
                Err(e) => warn!(%key, error = %e, "ignoring watcher removal"),
            },
        }
    }

    /// Consume config events until shutdown or until every sender is gone,
    /// then stop all watchers.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<ConfigEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("watcher registry started");

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle(event).await,
                        None => {
                            debug!("config event stream closed");
                            // Keep the current watchers until shutdown.
                            let _ = shutdown.changed().await;
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        self.stop_all().await;
    }

    /// Stop every watcher (for graceful shutdown).
    pub async fn stop_all(&self) {
        let drained: Vec<WatcherSlot> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, slot)| slot).collect()
        };

        let count = drained.len();
        for slot in drained {
            self.shutdown_slot(slot).await;
        }
        info!(count, "all watchers stopped");
    }

    /// Keys of all registered watchers.
    pub async fn keys(&self) -> Vec<WatchKey> {
        let mut keys: Vec<_> = self.slots.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn is_watching(&self, key: &str) -> bool {
        self.slots.lock().await.contains_key(key)
    }

    /// Id of the watcher registered under `key`.
    pub async fn watcher_id(&self, key: &str) -> Option<WatcherId> {
        self.slots.lock().await.get(key).map(|slot| slot.id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qdepth_core::ScaleOp;
    use qdepth_core::testing::{FakeBroker, FakeOrchestrator};
    use qdepth_ops::OperationData;

    fn spec(key: &str, deployment: &str, job_type: &str) -> WatchedDeployment {
        WatchedDeployment {
            key: key.to_string(),
            deployment_name: deployment.to_string(),
            namespace: "default".to_string(),
            job_type: job_type.to_string(),
            pending_time_minutes: None,
        }
    }

    fn registry() -> (WatcherRegistry, OperationStore, Arc<FakeBroker>, Arc<FakeOrchestrator>) {
        let store = OperationStore::default();
        let broker = Arc::new(FakeBroker::new());
        let orch = Arc::new(FakeOrchestrator::new());
        let registry = WatcherRegistry::new(
            store.clone(),
            broker.clone(),
            orch.clone(),
            WatcherSettings {
                sample_interval: Duration::from_secs(5),
                query_timeout: Duration::from_secs(1),
                default_pending_time: Duration::from_secs(600),
            },
        );
        (registry, store, broker, orch)
    }

    #[tokio::test]
    async fn add_starts_watcher_and_indexes_directory() {
        let (registry, ..) = registry();

        let outcome = registry.add(spec("a:default", "svc-a", "convert")).await.unwrap();
        let AddOutcome::Started(id) = outcome else {
            panic!("expected a new watcher");
        };

        assert!(registry.is_watching("a:default").await);
        assert_eq!(registry.watcher_id("a:default").await, Some(id.clone()));

        let info = registry.directory().lookup(&id).await.unwrap();
        assert_eq!(info.deployment, DeploymentRef::new("default", "svc-a"));
        assert_eq!(info.job_type, "convert");

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn add_rejects_invalid_specs() {
        let (registry, ..) = registry();

        let err = registry.add(spec("a:default", "", "convert")).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSpec { .. }));

        let err = registry.add(spec("a:default", "svc-a", "")).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSpec { .. }));

        let mut negative = spec("a:default", "svc-a", "convert");
        negative.pending_time_minutes = Some(-1.0);
        let err = registry.add(negative).await.unwrap_err();
        assert!(matches!(err, RegistryError::InvalidSpec { .. }));

        assert!(registry.keys().await.is_empty());
    }

    #[tokio::test]
    async fn one_watcher_per_deployment() {
        let (registry, ..) = registry();
        registry.add(spec("a:default", "svc-a", "convert")).await.unwrap();

        let err = registry.add(spec("b:default", "svc-a", "newMedia")).await.unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateDeployment {
                deployment: "default/svc-a".to_string(),
                existing: "a:default".to_string(),
            }
        );

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn re_adding_same_key() {
        let (registry, ..) = registry();
        let AddOutcome::Started(first) = registry.add(spec("a:default", "svc-a", "convert")).await.unwrap() else {
            panic!("expected a new watcher");
        };

        let again = registry.add(spec("a:default", "svc-a", "convert")).await.unwrap();
        assert_eq!(again, AddOutcome::Unchanged(first.clone()));

        let changed = registry.add(spec("a:default", "svc-a", "newMedia")).await.unwrap();
        let AddOutcome::Replaced(second) = changed else {
            panic!("expected replacement");
        };
        assert_ne!(first, second);
        assert!(registry.directory().lookup(&first).await.is_none());
        assert_eq!(registry.directory().len().await, 1);

        registry.stop_all().await;
    }

    #[tokio::test]
    async fn remove_unknown_key_is_not_found() {
        let (registry, ..) = registry();
        assert_eq!(
            registry.remove("ghost:default").await,
            Err(RegistryError::NotFound("ghost:default".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cleans_up_watcher_operations() {
        let (registry, store, broker, orch) = registry();
        let svc = DeploymentRef::new("default", "svc-a");
        broker.set_depth("convert", 4, 0);
        orch.set_deployment(&svc, 1, true);

        let AddOutcome::Started(id) = registry.add(spec("a:default", "svc-a", "convert")).await.unwrap() else {
            panic!("expected a new watcher");
        };

        // Let the watcher tick once.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(store.exists(&OperationData::new(id.clone(), ScaleOp::ScaleUp, "convert")).await.is_some());

        let removed = registry.remove("a:default").await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.list().await.is_empty());
        assert!(registry.directory().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_do_not_wait_for_a_stopping_watcher() {
        let (registry, store, broker, orch) = registry();
        let registry = Arc::new(registry);
        broker.set_depth("convert", 4, 0);
        orch.set_deployment(&DeploymentRef::new("default", "svc-a"), 1, true);
        broker.hold();

        registry.add(spec("a:default", "svc-a", "convert")).await.unwrap();
        broker.wait_for_query().await;

        let removal = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.remove("a:default").await })
        };
        while registry.is_watching("a:default").await {
            tokio::task::yield_now().await;
        }

        // The watcher is still parked in its broker query.
        assert!(registry.keys().await.is_empty());
        assert!(!removal.is_finished());

        broker.release();
        assert_eq!(removal.await.unwrap().unwrap(), 0);
        assert!(store.list().await.is_empty());
    }

    #[tokio::test]
    async fn handle_swallows_errors() {
        let (registry, ..) = registry();
        registry.handle(ConfigEvent::Added(spec("a:default", "", "convert"))).await;
        registry
            .handle(ConfigEvent::Removed {
                key: "a:default".to_string(),
            })
            .await;
        assert!(registry.keys().await.is_empty());
    }

    #[tokio::test]
    async fn run_applies_events_and_stops_all_on_shutdown() {
        let (registry, ..) = registry();
        let registry = Arc::new(registry);
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.run(rx, shutdown_rx).await })
        };

        tx.send(ConfigEvent::Added(spec("a:default", "svc-a", "convert"))).await.unwrap();
        tx.send(ConfigEvent::Added(spec("b:default", "svc-b", "newMedia"))).await.unwrap();
        tx.send(ConfigEvent::Removed {
            key: "a:default".to_string(),
        })
        .await
        .unwrap();

        // Wait until the registry has caught up with the three events.
        while registry.keys().await != vec!["b:default".to_string()] {
            tokio::task::yield_now().await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();
        assert!(registry.keys().await.is_empty());
        assert!(registry.directory().is_empty().await);
    }
}
