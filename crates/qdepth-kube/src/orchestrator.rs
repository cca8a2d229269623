//! Deployment scaling through the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use kube::Client;
use kube::api::{Api, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, info};

use qdepth_core::{CollaboratorError, CollaboratorResult, DeploymentRef, DeploymentState, Orchestrator};

const SERVICE: &str = "orchestrator";

/// Desired replica count. An unset `spec.replicas` means the API default of 1.
pub fn replicas_of(deployment: &Deployment) -> u32 {
    let replicas = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    u32::try_from(replicas).unwrap_or(0)
}

/// False only when the deployment reports `Available=False`.
pub fn is_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Available"))
        .is_none_or(|condition| condition.status != "False")
}

pub fn state_of(deployment: &Deployment) -> DeploymentState {
    DeploymentState {
        replicas: replicas_of(deployment),
        available: is_available(deployment),
    }
}

fn map_error(deployment: &DeploymentRef, err: kube::Error) -> CollaboratorError {
    match err {
        kube::Error::Api(response) if response.code == 404 => {
            CollaboratorError::NotFound(deployment.to_string())
        }
        other => CollaboratorError::unavailable(SERVICE, other),
    }
}

/// Orchestrator backed by a Kubernetes cluster.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl KubeOrchestrator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, deployment: &DeploymentRef) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &deployment.namespace)
    }

    async fn fetch(&self, deployment: &DeploymentRef) -> CollaboratorResult<Deployment> {
        self.api(deployment)
            .get(&deployment.name)
            .await
            .map_err(|e| map_error(deployment, e))
    }

    /// Merge-patch `spec.replicas`.
    async fn set_replicas(&self, deployment: &DeploymentRef, replicas: u32) -> CollaboratorResult<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.api(deployment)
            .patch(&deployment.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(deployment, e))?;
        Ok(())
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn get_replicas(&self, deployment: &DeploymentRef) -> CollaboratorResult<u32> {
        let replicas = replicas_of(&self.fetch(deployment).await?);
        debug!(%deployment, replicas, "deployment replicas");
        Ok(replicas)
    }

    async fn can_scale(&self, deployment: &DeploymentRef) -> CollaboratorResult<bool> {
        Ok(is_available(&self.fetch(deployment).await?))
    }

    async fn deployment_state(&self, deployment: &DeploymentRef) -> CollaboratorResult<DeploymentState> {
        let state = state_of(&self.fetch(deployment).await?);
        debug!(%deployment, replicas = state.replicas, available = state.available, "deployment state");
        Ok(state)
    }

    async fn scale_up(&self, deployment: &DeploymentRef) -> CollaboratorResult<()> {
        let current = self.get_replicas(deployment).await?;
        info!(%deployment, from = current, to = current + 1, "scale up");
        self.set_replicas(deployment, current.saturating_add(1)).await
    }

    async fn scale_down(&self, deployment: &DeploymentRef) -> CollaboratorResult<()> {
        let current = self.get_replicas(deployment).await?;
        let target = current.saturating_sub(1);
        info!(%deployment, from = current, to = target, "scale down");
        self.set_replicas(deployment, target).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};

    fn deployment(replicas: Option<i32>, available: Option<&str>) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                conditions: available.map(|status| {
                    vec![
                        DeploymentCondition {
                            type_: "Progressing".to_string(),
                            status: "True".to_string(),
                            ..Default::default()
                        },
                        DeploymentCondition {
                            type_: "Available".to_string(),
                            status: status.to_string(),
                            ..Default::default()
                        },
                    ]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn replicas_default_to_one() {
        assert_eq!(replicas_of(&deployment(Some(4), None)), 4);
        assert_eq!(replicas_of(&deployment(None, None)), 1);
        assert_eq!(replicas_of(&Deployment::default()), 1);
    }

    #[test]
    fn only_available_false_blocks_scaling() {
        assert!(is_available(&deployment(Some(1), Some("True"))));
        assert!(is_available(&deployment(Some(1), Some("Unknown"))));
        assert!(is_available(&deployment(Some(1), None)));
        assert!(!is_available(&deployment(Some(1), Some("False"))));
    }

    #[test]
    fn state_reads_replicas_and_availability_from_one_object() {
        assert_eq!(
            state_of(&deployment(Some(3), Some("False"))),
            DeploymentState {
                replicas: 3,
                available: false,
            }
        );
        assert_eq!(
            state_of(&deployment(None, Some("True"))),
            DeploymentState {
                replicas: 1,
                available: true,
            }
        );
    }
}
