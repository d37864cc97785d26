//! logship-collector: receives events from agents and persists them.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use logship::config::CollectorConfig;
use logship::server::{spawn_signal_handlers, Collector};
use logship::store::{connect_with_backoff, FjallStore, MemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "logship-collector", version, about = "Collect forwarded event logs")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "LOGSHIP_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address (overrides listen.address)
    #[arg(long)]
    listen: Option<String>,

    /// Listen port (overrides listen.port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Store directory (overrides store.path)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep everything in memory; nothing survives a restart
    #[arg(long)]
    ephemeral: bool,

    /// Worker threads for store calls (overrides workers.threads)
    #[arg(long)]
    workers: Option<usize>,

    /// Verbose logging (debug level)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut CollectorConfig) {
        if let Some(listen) = &self.listen {
            config.listen.address = listen.clone();
        }
        if let Some(port) = self.port {
            config.listen.port = port;
        }
        if let Some(dir) = &self.data_dir {
            config.store.path = dir.clone();
        }
        if let Some(workers) = self.workers {
            config.workers.threads = workers;
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = CollectorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let store: Arc<dyn Store> = if cli.ephemeral {
        tracing::warn!("running with an in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        std::fs::create_dir_all(&config.store.path).with_context(|| {
            format!("creating store directory {}", config.store.path.display())
        })?;
        Arc::new(FjallStore::new(&config.store.path))
    };

    tracing::info!(
        listen = %format!("{}:{}", config.listen.address, config.listen.port),
        store = %config.store.path.display(),
        ephemeral = cli.ephemeral,
        workers = config.workers.threads,
        "logship-collector starting"
    );

    connect_with_backoff(
        store.as_ref(),
        config.store.connect_attempts,
        config.store.backoff_base(),
    )
    .context("store unavailable, not serving")?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let collector = Collector::bind(&config, store)
            .await
            .context("starting collector")?;
        spawn_signal_handlers(collector.handle()).context("installing signal handlers")?;
        collector.run().await.context("collector stopped with an error")
    })?;

    tracing::info!("logship-collector exited");
    Ok(())
}
