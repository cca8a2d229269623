//! Management API client.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use qdepth_core::config::BrokerConfig;
use qdepth_core::{Broker, CollaboratorError, CollaboratorResult, QueueDepth};

const SERVICE: &str = "broker";

/// One entry of `GET /api/bindings`.
#[derive(Debug, Clone, Deserialize)]
pub struct Binding {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub destination_type: String,
    #[serde(default)]
    pub vhost: String,
}

/// One entry of `GET /api/queues`. Counters are absent on queues the
/// server has not collected stats for yet.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    #[serde(default)]
    pub vhost: String,
    #[serde(default)]
    pub messages_ready: u64,
    #[serde(default)]
    pub messages_unacknowledged: u64,
}

/// Sum the depth of every queue bound to `exchange`.
///
/// Bound queues that do not appear in `queues` are skipped.
pub fn aggregate_depth(exchange: &str, bindings: &[Binding], queues: &[QueueInfo]) -> QueueDepth {
    let known: HashMap<(&str, &str), &QueueInfo> = queues
        .iter()
        .map(|q| ((q.vhost.as_str(), q.name.as_str()), q))
        .collect();

    let bound: Vec<&Binding> = bindings
        .iter()
        .filter(|b| b.source == exchange)
        .filter(|b| b.destination_type.is_empty() || b.destination_type == "queue")
        .collect();

    debug!(exchange, queues = bound.len(), "exchange bindings");

    let mut depth = QueueDepth::default();
    for binding in bound {
        let Some(queue) = known.get(&(binding.vhost.as_str(), binding.destination.as_str())) else {
            warn!(exchange, queue = %binding.destination, "bound queue not found, skipping");
            continue;
        };
        depth.ready += queue.messages_ready;
        depth.inflight += queue.messages_unacknowledged;
    }
    depth
}

/// Broker backed by the RabbitMQ management HTTP API.
pub struct RabbitBroker {
    client: reqwest::Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
    vhost: Option<String>,
}

impl RabbitBroker {
    pub fn new(config: &BrokerConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    pub fn with_client(client: reqwest::Client, config: &BrokerConfig) -> Self {
        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            vhost: config.vhost.clone(),
        }
    }

    /// URL of a collection endpoint, scoped to the vhost when one is set.
    fn endpoint(&self, collection: &str) -> String {
        match &self.vhost {
            Some(vhost) => format!("{}/{collection}/{}", self.base_url, encode_segment(vhost)),
            None => format!("{}/{collection}", self.base_url),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, collection: &str) -> CollaboratorResult<T> {
        let mut request = self.client.get(self.endpoint(collection));
        if let Some(user) = &self.username {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| CollaboratorError::unavailable(SERVICE, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::unavailable(
                SERVICE,
                format!("GET /{collection} returned {status}: {body}"),
            ));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CollaboratorError::malformed(SERVICE, e))
    }
}

#[async_trait]
impl Broker for RabbitBroker {
    async fn queue_depth(&self, job_type: &str) -> CollaboratorResult<QueueDepth> {
        let bindings: Vec<Binding> = self.fetch("bindings").await?;
        let queues: Vec<QueueInfo> = self.fetch("queues").await?;
        Ok(aggregate_depth(job_type, &bindings, &queues))
    }
}

/// Percent-encode a path segment. Vhost names are routinely `/`.
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
