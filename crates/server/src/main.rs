//! stash daemon and operator commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use stash_core::config::{AppConfig, OperatorFlags};
use stash_server::{FileSystem, GarbageCollector, GcKind, GcScheduler};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// stash - a virtual filesystem over blob storage
#[derive(Parser, Debug)]
#[command(name = "stashd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "STASH_CONFIG", default_value = "config/stash.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the GC scheduler until interrupted (default)
    Run,
    /// Run GC once and exit
    GcOnce {
        /// Only this kind (upload, blob or file)
        #[arg(long)]
        kind: Option<GcKind>,
        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Show or change operator flags
    Flags {
        #[arg(long)]
        freeze_gc: Option<bool>,
        #[arg(long)]
        allow_clear_all_files: Option<bool>,
    },
    /// Print record counts
    Stats,
    /// Compare stored reference counts with file records
    Audit,
}

fn load_config(path: &str) -> Result<AppConfig> {
    let config_path = std::path::Path::new(path);
    let mut figment = Figment::new();
    if config_path.exists() {
        tracing::info!(config_path = %path, "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        let has_env_config =
            std::env::vars().any(|(key, _)| key.starts_with("STASH_") && key != "STASH_CONFIG");
        if !has_env_config {
            anyhow::bail!(
                "No configuration provided.\n\n\
                 Provide configuration via one of:\n  \
                 1. Config file: stashd --config /path/to/stash.toml\n  \
                 2. Environment variables: STASH_METADATA__TYPE=sqlite \
                 STASH_METADATA__PATH=./data/metadata.db STASH_STORAGE__TYPE=filesystem \
                 STASH_STORAGE__PATH=./data/blobs stashd"
            );
        }
        tracing::info!("Using environment variables for configuration");
    }

    figment
        .merge(Env::prefixed("STASH_").split("__"))
        .extract()
        .context("failed to load configuration")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args.config)?;
    stash_server::metrics::register_metrics();

    let fs = FileSystem::from_config(&config)
        .await
        .context("failed to open stash")?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(fs, &config).await,
        Command::GcOnce { kind, metrics } => {
            gc_once(&fs, &config, kind).await?;
            if metrics {
                print!("{}", stash_server::metrics::gather_metrics()?);
            }
            Ok(())
        }
        Command::Flags {
            freeze_gc,
            allow_clear_all_files,
        } => flags(&fs, freeze_gc, allow_clear_all_files).await,
        Command::Stats => {
            let stats = fs.stats().await.context("failed to read stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        Command::Audit => {
            let discrepancies = fs.audit_refcounts().await.context("audit failed")?;
            println!("{}", serde_json::to_string_pretty(&discrepancies)?);
            if !discrepancies.is_empty() {
                anyhow::bail!("{} reference count discrepancies", discrepancies.len());
            }
            Ok(())
        }
    }
}

async fn run(fs: FileSystem, config: &AppConfig) -> Result<()> {
    tracing::info!("stash v{}", env!("CARGO_PKG_VERSION"));
    fs.storage()
        .health_check()
        .await
        .context("storage health check failed")?;

    if !config.gc.enabled {
        tracing::warn!("GC disabled by configuration; nothing to run");
        return Ok(());
    }

    let collector = Arc::new(GarbageCollector::new(fs.metadata().clone()));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = GcScheduler::new(collector, &config.gc).spawn(shutdown_rx);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);
    handle.await.context("GC scheduler panicked")?;
    Ok(())
}

async fn gc_once(fs: &FileSystem, config: &AppConfig, kind: Option<GcKind>) -> Result<()> {
    let collector = GarbageCollector::new(fs.metadata().clone());
    let kinds = match kind {
        Some(kind) => vec![kind],
        None => GcKind::ALL.to_vec(),
    };
    for kind in kinds {
        let summary = collector
            .run_until_drained(kind, config.gc.max_batches_per_tick)
            .await
            .with_context(|| format!("{kind} GC failed"))?;
        match summary.skipped {
            Some(reason) => println!("{kind}: skipped ({})", reason.as_str()),
            None => println!(
                "{kind}: batches={} scanned={} deleted={} not_found={} errors={}",
                summary.batches, summary.scanned, summary.deleted, summary.not_found, summary.errors
            ),
        }
    }
    Ok(())
}

async fn flags(
    fs: &FileSystem,
    freeze_gc: Option<bool>,
    allow_clear_all_files: Option<bool>,
) -> Result<()> {
    use stash_metadata::repos::ConfigRepo;

    let current = fs
        .metadata()
        .get_stored_config()
        .await?
        .context("no stored configuration")?;
    let row = if freeze_gc.is_none() && allow_clear_all_files.is_none() {
        current
    } else {
        fs.set_operator_flags(OperatorFlags {
            freeze_gc: freeze_gc.unwrap_or(current.freeze_gc),
            allow_clear_all_files: allow_clear_all_files.unwrap_or(current.allow_clear_all_files),
        })
        .await?
    };
    println!(
        "freeze_gc={} allow_clear_all_files={} (config version {})",
        row.freeze_gc, row.allow_clear_all_files, row.version
    );
    Ok(())
}
