//! AutoscalerWatcher resources → config events.
//!
//! The watch stream relists on every (re)connect. Resources deleted while
//! the stream was down never produce a delete event, so the relist is
//! diffed against the keys seen before it.

use std::collections::HashSet;

use futures_util::StreamExt;
use kube::Client;
use kube::api::Api;
use kube::runtime::{WatchStreamExt, watcher};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use qdepth_core::{ConfigEvent, WatchKey};

use crate::crd::{AutoscalerWatcher, to_watched_deployment, watch_key};

/// Tracks which resources exist and translates watch events.
#[derive(Debug, Default)]
pub struct ResourceSync {
    known: HashSet<WatchKey>,
    /// Keys seen during an in-progress relist.
    relist: Option<HashSet<WatchKey>>,
}

impl ResourceSync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn known(&self) -> impl Iterator<Item = &WatchKey> {
        self.known.iter()
    }

    /// Config events implied by one watch event.
    pub fn translate(&mut self, event: watcher::Event<AutoscalerWatcher>) -> Vec<ConfigEvent> {
        match event {
            watcher::Event::Apply(resource) => vec![self.applied(&resource)],
            watcher::Event::Delete(resource) => {
                let key = watch_key(&resource);
                self.known.remove(&key);
                vec![ConfigEvent::Removed { key }]
            }
            watcher::Event::Init => {
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(resource) => {
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(watch_key(&resource));
                }
                vec![self.applied(&resource)]
            }
            watcher::Event::InitDone => {
                let Some(seen) = self.relist.take() else {
                    return Vec::new();
                };
                let mut gone: Vec<WatchKey> = self.known.difference(&seen).cloned().collect();
                gone.sort();
                for key in &gone {
                    self.known.remove(key);
                }
                gone.into_iter()
                    .map(|key| ConfigEvent::Removed { key })
                    .collect()
            }
        }
    }

    fn applied(&mut self, resource: &AutoscalerWatcher) -> ConfigEvent {
        let spec = to_watched_deployment(resource);
        self.known.insert(spec.key.clone());
        ConfigEvent::Added(spec)
    }
}

/// Follow AutoscalerWatcher resources and forward config events until
/// shutdown or until the receiver is dropped.
///
/// Watches one namespace, or all of them when `namespace` is `None`.
/// Stream errors are logged; the stream reconnects with backoff.
pub async fn watch_resources(
    client: Client,
    namespace: Option<String>,
    events: mpsc::Sender<ConfigEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let api: Api<AutoscalerWatcher> = match &namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    info!(namespace = namespace.as_deref().unwrap_or("<all>"), "watching AutoscalerWatcher resources");

    let stream = watcher(api, watcher::Config::default()).default_backoff();
    let mut stream = std::pin::pin!(stream);
    let mut sync = ResourceSync::new();

    loop {
        tokio::select! {
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        for config_event in sync.translate(event) {
                            debug!(event = ?config_event, "resource change");
                            if events.send(config_event).await.is_err() {
                                debug!("config event receiver dropped");
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "AutoscalerWatcher watch error"),
                    None => {
                        warn!("AutoscalerWatcher watch stream ended");
                        return;
                    }
                }
            }
            _ = shutdown.changed() => {
                debug!("resource watch shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AutoscalerWatcherSpec;

    fn resource(name: &str, deployment: &str) -> AutoscalerWatcher {
        let mut resource = AutoscalerWatcher::new(
            name,
            AutoscalerWatcherSpec {
                deployment_name: deployment.to_string(),
                job_type: "v1.convert".to_string(),
                pending_time_minutes: None,
            },
        );
        resource.metadata.namespace = Some("jobs".to_string());
        resource
    }

    fn removed(key: &str) -> ConfigEvent {
        ConfigEvent::Removed {
            key: key.to_string(),
        }
    }

    #[test]
    fn apply_and_delete() {
        let mut sync = ResourceSync::new();

        let events = sync.translate(watcher::Event::Apply(resource("a", "svc-a")));
        let [ConfigEvent::Added(spec)] = events.as_slice() else {
            panic!("expected one add, got {events:?}");
        };
        assert_eq!(spec.key, "a:jobs");
        assert_eq!(spec.deployment_name, "svc-a");

        let events = sync.translate(watcher::Event::Delete(resource("a", "svc-a")));
        assert_eq!(events, vec![removed("a:jobs")]);
        assert_eq!(sync.known().count(), 0);
    }

    #[test]
    fn relist_removes_resources_deleted_while_disconnected() {
        let mut sync = ResourceSync::new();
        sync.translate(watcher::Event::Apply(resource("a", "svc-a")));
        sync.translate(watcher::Event::Apply(resource("b", "svc-b")));

        assert!(sync.translate(watcher::Event::Init).is_empty());
        let events = sync.translate(watcher::Event::InitApply(resource("b", "svc-b")));
        assert!(matches!(events.as_slice(), [ConfigEvent::Added(_)]));

        let events = sync.translate(watcher::Event::InitDone);
        assert_eq!(events, vec![removed("a:jobs")]);

        let known: Vec<_> = sync.known().cloned().collect();
        assert_eq!(known, vec!["b:jobs".to_string()]);
    }

    #[test]
    fn init_done_without_init_is_ignored() {
        let mut sync = ResourceSync::new();
        sync.translate(watcher::Event::Apply(resource("a", "svc-a")));
        assert!(sync.translate(watcher::Event::InitDone).is_empty());
    }
}
