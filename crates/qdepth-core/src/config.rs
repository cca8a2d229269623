//! qdepth.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::WatchedDeployment;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QdepthConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    pub broker: Option<BrokerConfig>,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    pub status: Option<StatusConfig>,
    #[serde(default)]
    pub watchers: Vec<StaticWatcher>,
}

/// Timing knobs for the control loop. Durations are strings like "500ms",
/// "5s" or "10m".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// How often the operation store expires and promotes operations.
    pub sweep_interval: String,
    /// How often the executor drains promoted operations.
    pub poll_interval: String,
    /// How often each watcher samples its queue.
    pub sample_interval: String,
    /// Upper bound on a single broker or orchestrator call.
    pub query_timeout: String,
    /// Default debounce before an operation may execute.
    pub promote_after: String,
    /// Idle time after which an unconfirmed operation is dropped.
    pub expire_after: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: "1s".to_string(),
            poll_interval: "5s".to_string(),
            sample_interval: "5s".to_string(),
            query_timeout: "10s".to_string(),
            promote_after: "10m".to_string(),
            expire_after: "60s".to_string(),
        }
    }
}

/// `ControllerConfig` with every duration parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub sweep_interval: Duration,
    pub poll_interval: Duration,
    pub sample_interval: Duration,
    pub query_timeout: Duration,
    pub promote_after: Duration,
    pub expire_after: Duration,
}

impl ControllerConfig {
    pub fn timings(&self) -> Result<Timings, ConfigError> {
        let field = |name: &str, value: &str| {
            parse_duration(value)
                .ok_or_else(|| ConfigError::Invalid(format!("controller.{name}: bad duration '{value}'")))
        };

        let timings = Timings {
            sweep_interval: field("sweep_interval", &self.sweep_interval)?,
            poll_interval: field("poll_interval", &self.poll_interval)?,
            sample_interval: field("sample_interval", &self.sample_interval)?,
            query_timeout: field("query_timeout", &self.query_timeout)?,
            promote_after: field("promote_after", &self.promote_after)?,
            expire_after: field("expire_after", &self.expire_after)?,
        };

        for (name, value) in [
            ("sweep_interval", timings.sweep_interval),
            ("poll_interval", timings.poll_interval),
            ("sample_interval", timings.sample_interval),
            ("query_timeout", timings.query_timeout),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("controller.{name} must be non-zero")));
            }
        }

        // A watcher refreshes its intents once per sample; anything shorter
        // expires every intent before it can be re-affirmed.
        if timings.expire_after <= timings.sample_interval {
            return Err(ConfigError::Invalid(format!(
                "controller.expire_after ({:?}) must exceed controller.sample_interval ({:?})",
                timings.expire_after, timings.sample_interval
            )));
        }

        Ok(timings)
    }
}

/// RabbitMQ management API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Base URL of the management API, e.g. `http://rabbitmq:15672/api`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Restrict bindings and queues to one vhost.
    pub vhost: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Namespace used for statically configured watchers.
    pub namespace: String,
    /// Follow `AutoscalerWatcher` custom resources.
    pub watch_crds: bool,
    /// Namespace to watch CRDs in. All namespaces when unset.
    pub crd_namespace: Option<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            watch_crds: false,
            crd_namespace: None,
        }
    }
}

/// Redis pub/sub target for status events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// `host:port` of the Redis server.
    pub address: String,
    #[serde(default = "default_channel")]
    pub channel: String,
    pub password: Option<String>,
    /// Overrides the hostname reported in events.
    pub host: Option<String>,
}

fn default_channel() -> String {
    "events".to_string()
}

/// A deployment listed directly in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticWatcher {
    pub deployment_name: String,
    pub job_type: String,
    pub namespace: Option<String>,
    pub pending_time_minutes: Option<f64>,
}

impl QdepthConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: QdepthConfig = toml::from_str(content)?;
        config.controller.timings()?;
        Ok(config)
    }

    /// Static watchers as registry input, keyed `static:<namespace>/<deployment>`.
    pub fn static_watchers(&self) -> Vec<WatchedDeployment> {
        self.watchers
            .iter()
            .map(|w| {
                let namespace = w
                    .namespace
                    .clone()
                    .unwrap_or_else(|| self.orchestrator.namespace.clone());
                WatchedDeployment {
                    key: format!("static:{namespace}/{}", w.deployment_name),
                    deployment_name: w.deployment_name.clone(),
                    namespace,
                    job_type: w.job_type.clone(),
                    pending_time_minutes: w.pending_time_minutes,
                }
            })
            .collect()
    }
}

/// Parse a duration string like "5s", "500ms", "10m". A bare number is
/// seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
