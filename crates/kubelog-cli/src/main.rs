use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kubelog_core::{Config, WorkloadKey, WorkloadKind, WorkloadRef};
use kubelog_kube::KubeCluster;
use kubelog_stream::{BroadcastHub, HubConfig, HubHandle, LogStreamer, Subscription, TailConfig};
use tokio::io::AsyncWriteExt;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod server;

use server::SubscriberServer;

#[derive(Parser, Debug)]
#[command(name = "kubelog")]
#[command(author, version, about = "Live Kubernetes workload logs for many subscribers")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Kubeconfig context to use
    #[arg(long, global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print live workload logs as JSON lines
    Tail {
        /// Workloads as <namespace>/<name>
        #[arg(required = true)]
        workloads: Vec<WorkloadKey>,
        /// Workload kind
        #[arg(short, long, default_value = "deployment")]
        kind: WorkloadKind,
    },
    /// Serve live workload logs to TCP subscribers
    Serve {
        /// Workloads as <namespace>/<name>
        #[arg(required = true)]
        workloads: Vec<WorkloadKey>,
        /// Workload kind
        #[arg(short, long, default_value = "deployment")]
        kind: WorkloadKind,
        /// Listen address (overrides the config file)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    // Logs go to stderr; stdout carries envelopes.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();
}

/// Start every workload. Fails only if none of them could be started.
async fn start_all(
    streamer: &LogStreamer,
    kind: WorkloadKind,
    workloads: Vec<WorkloadKey>,
) -> Result<usize> {
    let requested = workloads.len();
    let mut started = 0;
    for key in workloads {
        // Failures are already logged by the streamer.
        if streamer.start_streaming(&WorkloadRef { kind, key }).await.is_ok() {
            started += 1;
        }
    }

    if started == 0 {
        anyhow::bail!("none of the {requested} requested workloads could be streamed");
    }
    if started < requested {
        tracing::warn!(started, requested, "Some workloads could not be streamed");
    }
    Ok(started)
}

/// Write envelopes to stdout, resubscribing if the hub drops us for falling
/// behind.
async fn print_envelopes(hub: HubHandle, mut subscription: Subscription) -> Result<()> {
    let mut stdout = tokio::io::stdout();

    loop {
        while let Some(message) = subscription.recv().await {
            stdout.write_all(&message).await?;
            stdout.write_all(b"\n").await?;
        }
        stdout.flush().await?;

        if hub.is_closed() {
            return Ok(());
        }
        tracing::warn!("Output fell behind and was disconnected, resubscribing");
        subscription = hub.subscribe().await;
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if cli.context.is_some() {
        config.context = cli.context;
    }

    let cluster = KubeCluster::connect(config.context.as_deref())
        .await
        .context("failed to connect to Kubernetes")?;
    let hub = BroadcastHub::start(HubConfig::from(&config));
    let streamer = LogStreamer::new(Arc::new(cluster), hub.handle(), TailConfig::from(&config));

    let printer = match cli.command {
        Commands::Tail { workloads, kind } => {
            let handle = hub.handle();
            let subscription = handle.subscribe().await;
            let printer = tokio::spawn(print_envelopes(handle, subscription));

            if let Err(e) = start_all(&streamer, kind, workloads).await {
                hub.shutdown().await;
                return Err(e);
            }
            shutdown_signal().await;
            Some(printer)
        }
        Commands::Serve {
            workloads,
            kind,
            bind,
        } => {
            let server = SubscriberServer::new(
                bind.unwrap_or(config.bind_addr),
                hub.handle(),
                config.max_subscribers,
            );

            if let Err(e) = start_all(&streamer, kind, workloads).await {
                hub.shutdown().await;
                return Err(e);
            }
            server.run_until(shutdown_signal()).await?;
            None
        }
    };

    tracing::info!("Shutting down...");
    let stopped = streamer.stop_all_streaming().await;
    tracing::info!(stopped, "Log streams stopped");
    hub.shutdown().await;

    if let Some(printer) = printer {
        printer.await??;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubelog_tests::FakeCluster;

    fn streamer(hub: &BroadcastHub) -> LogStreamer {
        let cluster = FakeCluster::new()
            .with_workload(WorkloadKind::Deployment, "ns/app", &[("app", "app")])
            .with_pod("ns", "app-abc", &[("app", "app")], &[], &["main"]);
        LogStreamer::new(Arc::new(cluster), hub.handle(), TailConfig::default())
    }

    fn keys(keys: &[&str]) -> Vec<WorkloadKey> {
        keys.iter().map(|key| key.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_start_all_fails_when_nothing_starts() {
        let hub = BroadcastHub::start(HubConfig::default());
        let streamer = streamer(&hub);

        let result = start_all(&streamer, WorkloadKind::Deployment, keys(&["ns/ghost", "ns/gone"])).await;
        assert!(result.is_err());
        assert!(streamer.active_streams().await.is_empty());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_all_counts_started_workloads() {
        let hub = BroadcastHub::start(HubConfig::default());
        let streamer = streamer(&hub);

        let started = start_all(&streamer, WorkloadKind::Deployment, keys(&["ns/app", "ns/ghost"]))
            .await
            .unwrap();
        assert_eq!(started, 1);

        assert_eq!(streamer.stop_all_streaming().await, 1);
        hub.shutdown().await;
    }
}
