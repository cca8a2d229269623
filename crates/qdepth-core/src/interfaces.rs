//! Capability traits for the systems qdepth talks to.
//!
//! The control loop only ever sees these traits. Concrete adapters live in
//! `qdepth-rabbitmq`, `qdepth-kube` and `qdepth-status`; in-memory fakes
//! live in [`crate::testing`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{DeploymentRef, DeploymentState, QueueDepth, StatusEvent};

/// Errors reported by an external collaborator.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },

    #[error("{service} call timed out after {elapsed:?}")]
    Timeout {
        service: &'static str,
        elapsed: Duration,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed response from {service}: {reason}")]
    Malformed { service: &'static str, reason: String },
}

impl CollaboratorError {
    pub fn unavailable(service: &'static str, reason: impl ToString) -> Self {
        Self::Unavailable {
            service,
            reason: reason.to_string(),
        }
    }

    pub fn malformed(service: &'static str, reason: impl ToString) -> Self {
        Self::Malformed {
            service,
            reason: reason.to_string(),
        }
    }
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Reports queue depth for a job type (an exchange on the broker).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn queue_depth(&self, job_type: &str) -> CollaboratorResult<QueueDepth>;
}

/// Reads and mutates deployment replica counts.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Desired replica count of the deployment.
    async fn get_replicas(&self, deployment: &DeploymentRef) -> CollaboratorResult<u32>;

    /// False only when the deployment reports `Available=False`.
    async fn can_scale(&self, deployment: &DeploymentRef) -> CollaboratorResult<bool>;

    /// `get_replicas` and `can_scale` together. Backends that can answer
    /// both from one read should override this.
    async fn deployment_state(&self, deployment: &DeploymentRef) -> CollaboratorResult<DeploymentState> {
        Ok(DeploymentState {
            replicas: self.get_replicas(deployment).await?,
            available: self.can_scale(deployment).await?,
        })
    }

    async fn scale_up(&self, deployment: &DeploymentRef) -> CollaboratorResult<()>;

    async fn scale_down(&self, deployment: &DeploymentRef) -> CollaboratorResult<()>;
}

/// Fire-and-forget sink for status events.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, event: StatusEvent) -> CollaboratorResult<()>;
}

/// Run a collaborator call with an upper bound on how long it may take.
pub async fn with_timeout<T, F>(
    service: &'static str,
    limit: Duration,
    call: F,
) -> CollaboratorResult<T>
where
    F: Future<Output = CollaboratorResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::Timeout {
            service,
            elapsed: limit,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_timeout_reports_stalled_calls() {
        let result: CollaboratorResult<()> = with_timeout("broker", Duration::from_secs(2), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(CollaboratorError::Timeout { service: "broker", elapsed }) if elapsed == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn with_timeout_passes_results_through() {
        let result = with_timeout("orchestrator", Duration::from_secs(1), async { Ok(3u32) }).await;
        assert_eq!(result.unwrap(), 3);
    }
}
