//! AutoscalerWatcher custom resource.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use qdepth_core::{WatchKey, WatchedDeployment};

/// Declares that a deployment should be scaled on the depth of a job queue.
#[derive(CustomResource, Clone, Debug, Deserialize, JsonSchema, Serialize, PartialEq)]
#[kube(
    group = "qdepth.io",
    version = "v1",
    kind = "AutoscalerWatcher",
    namespaced,
    shortname = "aw"
)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerWatcherSpec {
    /// Deployment in the resource's namespace.
    pub deployment_name: String,
    /// Exchange whose bound queues are sampled.
    pub job_type: String,
    /// How long a condition must hold before it is acted on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_time_minutes: Option<f64>,
}

/// Registry key for a resource: `name:namespace`.
pub fn watch_key(resource: &AutoscalerWatcher) -> WatchKey {
    let namespace = resource.namespace().unwrap_or_else(|| "default".to_string());
    format!("{}:{namespace}", resource.name_any())
}

/// Translate a resource into a watcher definition.
pub fn to_watched_deployment(resource: &AutoscalerWatcher) -> WatchedDeployment {
    WatchedDeployment {
        key: watch_key(resource),
        deployment_name: resource.spec.deployment_name.clone(),
        namespace: resource.namespace().unwrap_or_else(|| "default".to_string()),
        job_type: resource.spec.job_type.clone(),
        pending_time_minutes: resource.spec.pending_time_minutes,
    }
}
