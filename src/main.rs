// ABOUTME: CLI entry point for database-extractor
// ABOUTME: `read` streams RECORD/STATE/LOG messages to stdout; `check` runs pre-flight validation

use anyhow::Context;
use clap::{Parser, Subcommand};
use database_extractor::catalog::ConfiguredCatalog;
use database_extractor::config::SourceConfig;
use database_extractor::preflight::run_preflight_checks;
use database_extractor::message::Message;
use database_extractor::state::{FileStateStore, InMemoryStateStore, StateManager, StateStore};
use database_extractor::{Orchestrator, SourceError, SourceSeams};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "database-extractor")]
#[command(about = "PostgreSQL source connector: full refresh, incremental and CDC extraction", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read every configured stream and write messages to stdout as JSON lines
    Read {
        /// Connector configuration (TOML, or JSON by extension)
        #[arg(long)]
        config: PathBuf,
        /// Configured catalog (JSON)
        #[arg(long)]
        catalog: PathBuf,
        /// State blob from the last STATE message of a previous run
        #[arg(long)]
        state: Option<PathBuf>,
        /// Persist every checkpoint here; read as prior state when --state is absent
        #[arg(long = "state-file")]
        state_file: Option<PathBuf>,
    },
    /// Verify the source is ready: privileges, wal_level, slot, publication and replica identity
    Check {
        #[arg(long)]
        config: PathBuf,
        /// Limit table checks to the streams in this catalog
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    // Logs go to stderr; stdout carries the message stream.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Read {
            config,
            catalog,
            state,
            state_file,
        } => read(config, catalog, state, state_file).await,
        Commands::Check { config, catalog } => check(config, catalog).await,
    }
}

async fn read(
    config_path: PathBuf,
    catalog_path: PathBuf,
    state_path: Option<PathBuf>,
    state_file: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = SourceConfig::load(&config_path)?;
    let catalog = ConfiguredCatalog::load(&catalog_path)?;
    tracing::debug!("Loaded configuration: {:?}", config);

    // The state file is written from the output loop below, after the STATE
    // line and every record before it have reached stdout.
    let file_store = state_file.map(FileStateStore::new);
    let persisted = match &file_store {
        Some(store) => store
            .read()
            .await
            .with_context(|| format!("Failed to read state file {:?}", store.path()))?,
        None => None,
    };
    let persisted = match &state_path {
        Some(path) => Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read state from {:?}", path))?,
        ),
        None => persisted,
    };
    let state = StateManager::load(persisted.as_deref(), Arc::new(InMemoryStateStore::new()))
        .map_err(reported)
        .context("Failed to load prior state")?;

    let seams = SourceSeams::connect(&config)
        .await
        .map_err(reported)
        .context("Failed to connect to source database")?;
    let orchestrator = Orchestrator::new(config, catalog, seams);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);

    // Set up Ctrl+C handler
    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx_clone.send(());
    });

    let (mut messages, handle) = orchestrator.spawn(state, shutdown_rx);
    let mut stdout = tokio::io::stdout();
    // Asking for the next message tells the sync this one is handled, so a
    // STATE must be flushed (and persisted) before the loop comes around.
    while let Some(message) = messages.next().await {
        let mut line = message.to_json_line()?;
        line.push('\n');
        stdout
            .write_all(line.as_bytes())
            .await
            .context("Failed to write message to stdout")?;
        if let Message::State { state } = &message {
            stdout.flush().await.context("Failed to flush stdout")?;
            if let Some(store) = &file_store {
                store
                    .persist(&state.data)
                    .await
                    .map_err(reported)
                    .with_context(|| format!("Failed to persist state to {:?}", store.path()))?;
            }
        }
    }
    stdout.flush().await?;
    drop(shutdown_tx);

    let summary = handle.await.context("Sync task panicked")?.map_err(reported)?;
    tracing::info!("Sync complete:");
    tracing::info!("  Streams: {}", summary.streams.len());
    tracing::info!("  Records emitted: {}", summary.records_emitted);
    tracing::info!("  Checkpoints: {}", summary.checkpoints);
    if !summary.is_success() {
        for err in &summary.errors {
            tracing::warn!("    - {}", err);
        }
        anyhow::bail!("{} stream error(s) during sync", summary.errors.len());
    }
    Ok(())
}

/// Carry the remediation hint into the CLI's error output.
fn reported(error: SourceError) -> anyhow::Error {
    anyhow::anyhow!(error.report())
}

async fn check(config_path: PathBuf, catalog_path: Option<PathBuf>) -> anyhow::Result<()> {
    let config = SourceConfig::load(&config_path)?;
    let catalog = catalog_path
        .as_deref()
        .map(ConfiguredCatalog::load)
        .transpose()?;
    if let Some(catalog) = &catalog {
        catalog.validate()?;
    }

    let result = run_preflight_checks(&config, catalog.as_ref()).await?;
    result.print();
    if !result.all_passed() {
        anyhow::bail!("Pre-flight checks failed: {} issue(s)", result.failed_count());
    }
    Ok(())
}
