//! Shared types used across qdepth crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a running watcher.
pub type WatcherId = String;

/// Stable identity of an external watch definition (`name:namespace` for
/// CRD objects, `static:<namespace>/<deployment>` for the static config list).
pub type WatchKey = String;

/// A scale direction. Every operation moves a deployment by one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaleOp {
    ScaleUp,
    ScaleDown,
}

impl ScaleOp {
    /// Event name published to the status sink.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleOp::ScaleUp => "scaleUp",
            ScaleOp::ScaleDown => "scaleDown",
        }
    }
}

impl fmt::Display for ScaleOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A namespaced deployment handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeploymentRef {
    pub namespace: String,
    pub name: String,
}

impl DeploymentRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeploymentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Ready and in-flight job counts for one exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Jobs queued but not yet claimed by a worker.
    pub ready: u64,
    /// Jobs claimed and currently being processed.
    pub inflight: u64,
}

/// Replica count and availability read together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeploymentState {
    pub replicas: u32,
    pub available: bool,
}

/// A deployment definition to watch, as delivered by static config or the
/// CRD stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchedDeployment {
    pub key: WatchKey,
    pub deployment_name: String,
    pub namespace: String,
    pub job_type: String,
    /// Debounce time in minutes. Falls back to the controller default.
    pub pending_time_minutes: Option<f64>,
}

impl WatchedDeployment {
    pub fn deployment(&self) -> DeploymentRef {
        DeploymentRef::new(&self.namespace, &self.deployment_name)
    }
}

/// A change to the set of watched deployments.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEvent {
    Added(WatchedDeployment),
    Removed { key: WatchKey },
}

/// Status event published after a scale operation is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    pub host: String,
}

impl StatusEvent {
    pub fn scaled(op: ScaleOp, deployment: &DeploymentRef, host: &str) -> Self {
        Self {
            event: op.as_str().to_string(),
            deployment: Some(deployment.name.clone()),
            host: host.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_op_serializes_camel_case() {
        assert_eq!(serde_json::to_string(&ScaleOp::ScaleUp).unwrap(), "\"scaleUp\"");
        assert_eq!(ScaleOp::ScaleDown.to_string(), "scaleDown");
    }

    #[test]
    fn status_event_omits_missing_deployment() {
        let event = StatusEvent {
            event: "started".to_string(),
            deployment: None,
            host: "node-a".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"started","host":"node-a"}"#);
    }

    #[test]
    fn scaled_event_names_the_deployment() {
        let event = StatusEvent::scaled(
            ScaleOp::ScaleDown,
            &DeploymentRef::new("default", "svc-a"),
            "node-a",
        );
        assert_eq!(event.event, "scaleDown");
        assert_eq!(event.deployment.as_deref(), Some("svc-a"));
    }

    #[test]
    fn deployment_ref_display() {
        assert_eq!(DeploymentRef::new("jobs", "converter").to_string(), "jobs/converter");
    }
}
