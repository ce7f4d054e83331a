//! silencerd - silence engine daemon.
//!
//! Runs the silence manager and its expiry worker against a SQLite
//! database, or answers one-shot `check` and `list` queries.

mod cli;

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use silencer::{
    ManagerConfig, SharedClock, SilenceManager, SilenceStore, SilencerConfig, SqliteStore,
    SystemClock,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ListArgs, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(cli.config.as_deref())?;
    let clock: SharedClock = Arc::new(SystemClock);
    let store = SqliteStore::connect(&cli.database_url, config.store.clone(), Arc::clone(&clock))
        .await
        .with_context(|| format!("failed to open silence database {}", cli.database_url))?;

    match cli.command {
        Commands::Run => run(store, config.manager, clock).await,
        Commands::Check { labels } => {
            let mut stdout = io::stdout().lock();
            check(store, config.manager, clock, labels, &mut stdout).await
        }
        Commands::List(args) => {
            let mut stdout = io::stdout().lock();
            list(&store, &args, &mut stdout).await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<SilencerConfig> {
    let Some(path) = path else {
        return Ok(SilencerConfig::default());
    };
    let config = SilencerConfig::from_json_file(path)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    info!(path = %path.display(), "loaded configuration");
    Ok(config)
}

async fn run(store: SqliteStore, config: ManagerConfig, clock: SharedClock) -> anyhow::Result<()> {
    let manager = SilenceManager::with_clock(Arc::new(store), config, clock)?;
    manager.start().await?;
    info!(cached = manager.cached_count(), "silencerd running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    manager.stop().await?;
    Ok(())
}

async fn check(
    store: SqliteStore,
    config: ManagerConfig,
    clock: SharedClock,
    labels: Vec<(String, String)>,
    out: &mut impl Write,
) -> anyhow::Result<()> {
    let manager = SilenceManager::with_clock(Arc::new(store), config, clock)?;
    manager.refresh_cache().await?;

    let labels: HashMap<String, String> = labels.into_iter().collect();
    let decision = manager.is_alert_silenced(&labels, &CancellationToken::new());

    serde_json::to_writer_pretty(&mut *out, &decision)?;
    writeln!(out)?;
    Ok(())
}

async fn list(store: &SqliteStore, args: &ListArgs, out: &mut impl Write) -> anyhow::Result<()> {
    let filter = args.to_filter();
    let total = store.count_silences(&filter).await?;
    let silences = store.list_silences(&filter).await?;

    serde_json::to_writer_pretty(&mut *out, &json!({ "total": total, "silences": silences }))?;
    writeln!(out)?;
    Ok(())
}
