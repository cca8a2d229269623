use async_trait::async_trait;
use tracing::info;

use qdepth_core::{CollaboratorResult, StatusEvent, StatusSink};

/// Status sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn publish(&self, event: StatusEvent) -> CollaboratorResult<()> {
        info!(
            event = %event.event,
            deployment = event.deployment.as_deref().unwrap_or("-"),
            host = %event.host,
            "status event"
        );
        Ok(())
    }
}
