//! qdepth-kube — Kubernetes integration.
//!
//! - [`KubeOrchestrator`] reads and patches `apps/v1` Deployments.
//! - [`AutoscalerWatcher`] is the custom resource that declares a watched
//!   deployment; [`watch_resources`] turns changes to it into config events.

pub mod crd;
pub mod orchestrator;
pub mod sync;

pub use crd::{AutoscalerWatcher, AutoscalerWatcherSpec, to_watched_deployment, watch_key};
pub use orchestrator::{KubeOrchestrator, is_available, replicas_of, state_of};
pub use sync::{ResourceSync, watch_resources};
