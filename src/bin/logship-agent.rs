//! logship-agent: forwards captured events to a collector.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;

use logship::agent::{AgentConnection, JsonLinesSource};
use logship::config::AgentConfig;
use logship::identity::Identity;

#[derive(Parser, Debug)]
#[command(name = "logship-agent", version, about = "Forward event logs to a logship collector")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "LOGSHIP_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Collector address (overrides server.address)
    #[arg(long)]
    server: Option<String>,

    /// Collector port (overrides server.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSON-lines event file (overrides source.path)
    #[arg(long)]
    source: Option<PathBuf>,

    /// Events per batch; full batches wait for an accept (overrides batch.max_events)
    #[arg(long)]
    batch: Option<usize>,

    /// Client name reported to the collector
    #[arg(long)]
    name: Option<String>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(server) = &self.server {
            config.server.address = server.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(source) = &self.source {
            config.source.path = source.clone();
        }
        if let Some(batch) = self.batch {
            config.batch.max_events = batch;
        }
        if let Some(name) = &self.name {
            config.identity.client_name = Some(name.clone());
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = AgentConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let identity = Identity::local(config.identity.client_name.as_deref());
    tracing::info!(
        server = %config.server_addr(),
        source = %config.source.path.display(),
        client = %identity.client_name,
        os = identity.os_kind.as_str(),
        os_version = %identity.os_version,
        machine_id = %identity.machine_id,
        batch = config.batch.max_events,
        "logship-agent starting"
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received SIGINT");
            let _ = stop_tx.send(true);
        }
    });

    let source = JsonLinesSource::new(&config.source.path);
    let mut agent = AgentConnection::new(&config, identity, source);
    agent.run(stop_rx).await.context("agent stopped with an error")?;

    tracing::info!(acked = agent.forwarder().acked(), "logship-agent exited");
    Ok(())
}
