//! qdepthd — scales deployments on the depth of their job queues.
//!
//! # Usage
//!
//! ```text
//! qdepthd run --config /etc/qdepth/qdepth.toml
//! qdepthd crd > autoscalerwatcher.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kube::CustomResourceExt;
use tracing::{info, warn};

use qdepth_core::{ConfigEvent, QdepthConfig, StatusSink};
use qdepth_kube::{AutoscalerWatcher, KubeOrchestrator};
use qdepth_rabbitmq::RabbitBroker;
use qdepth_status::{LogSink, RedisPublisher};
use qdepthd::logging::{self, LogFormat};
use qdepthd::{Collaborators, ControlPlane, host};

#[derive(Parser)]
#[command(name = "qdepthd", about = "Queue-depth driven deployment autoscaler")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the autoscaler.
    Run {
        /// Path to qdepth.toml.
        #[arg(long, default_value = "/etc/qdepth/qdepth.toml")]
        config: PathBuf,
    },
    /// Print the AutoscalerWatcher CustomResourceDefinition as JSON.
    Crd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Crd => {
            println!("{}", serde_json::to_string_pretty(&AutoscalerWatcher::crd())?);
            Ok(())
        }
        Command::Run { config } => {
            logging::init(cli.log_format);
            run(config).await
        }
    }
}

async fn run(path: PathBuf) -> anyhow::Result<()> {
    let config = QdepthConfig::from_file(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let timings = config.controller.timings()?;
    info!(config = %path.display(), "qdepthd starting");

    // ── Collaborators ──────────────────────────────────────────

    let broker_config = config
        .broker
        .as_ref()
        .context("config is missing the [broker] section")?;
    let broker = Arc::new(RabbitBroker::new(broker_config));
    info!(url = %broker_config.url, "rabbitmq management api configured");

    let client = kube::Client::try_default()
        .await
        .context("connecting to kubernetes")?;
    let orchestrator = Arc::new(KubeOrchestrator::new(client.clone()));

    let status: Arc<dyn StatusSink> = match &config.status {
        Some(status) => {
            info!(address = %status.address, channel = %status.channel, "publishing status to redis");
            Arc::new(RedisPublisher::new(status, timings.query_timeout))
        }
        None => {
            warn!("no [status] section, status events are only logged");
            Arc::new(LogSink)
        }
    };

    let host = host::resolve(config.status.as_ref().and_then(|s| s.host.as_deref()));

    // ── Control plane ──────────────────────────────────────────

    let plane = ControlPlane::new(
        timings,
        Collaborators {
            broker,
            orchestrator,
            status,
        },
        host.clone(),
    )
    .start();
    info!(%host, "control plane running");

    let events = plane.events();
    for spec in config.static_watchers() {
        events.send(ConfigEvent::Added(spec)).await?;
    }

    let crd_watch = config.orchestrator.watch_crds.then(|| {
        tokio::spawn(qdepth_kube::watch_resources(
            client,
            config.orchestrator.crd_namespace.clone(),
            events.clone(),
            plane.shutdown_signal(),
        ))
    });
    drop(events);

    tokio::signal::ctrl_c()
        .await
        .context("installing ctrl-c handler")?;
    info!("shutdown signal received");

    plane.shutdown().await;
    if let Some(handle) = crd_watch {
        let _ = handle.await;
    }

    info!("qdepthd stopped");
    Ok(())
}
