//! Overwatch Server - Standalone headless runtime for Overwatch.
//!
//! This binary runs the full analytics pipeline without a UI: it boots the
//! core services, starts configured sources, deploys workflow documents
//! from disk, and shuts everything down cleanly on Ctrl+C or SIGTERM.

mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use overwatch_core::{
    bootstrap_services_with, BootstrapOptions, BootstrappedServices, JsonPersistence, Persistence,
    TokioSpawner,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Overwatch Server - headless multi-camera video analytics runtime.
#[derive(Parser, Debug)]
#[command(name = "overwatch-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "OVERWATCH_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Data directory for persistent state (overrides config file).
    #[arg(short = 'd', long, env = "OVERWATCH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Directory of workflow documents deployed at startup.
    #[arg(short = 'w', long, env = "OVERWATCH_WORKFLOWS_DIR")]
    workflows_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Overwatch Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        ServerConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }
    if let Some(workflows_dir) = args.workflows_dir {
        config.workflows_dir = Some(workflows_dir);
    }

    // Durable persistence when a data directory is configured, in-memory
    // otherwise.
    let mut options = BootstrapOptions::default();
    if let Some(ref data_dir) = config.data_dir {
        log::info!("Using data directory: {}", data_dir.display());
        let persistence = JsonPersistence::open(
            data_dir,
            CancellationToken::new(),
            &TokioSpawner::current(),
        )
        .context("Failed to open data directory")?;
        options.persistence = Arc::new(persistence);
    } else {
        log::info!("No data directory configured - state will not persist");
    }

    let services =
        bootstrap_services_with(&config.core, options).context("Failed to bootstrap services")?;

    log::info!("Services bootstrapped successfully");

    services.start_background_tasks();

    // Start configured sources before deploying workflows that subscribe
    // to them.
    for source in &config.sources {
        match services.sources.start(source.clone()) {
            Ok(_) => log::info!("Source {} started", source.id),
            Err(err) => log::error!("Source {} failed to start: {err}", source.id),
        }
    }

    // Redeploy persisted workflows, then anything staged on disk.
    redeploy_persisted(&services).await;
    if let Some(ref dir) = config.workflows_dir {
        deploy_from_dir(&services, dir).await;
    }

    log::info!(
        "Runtime up: {} source(s), {} workflow(s)",
        config.sources.len(),
        services.engine.running_ids().len()
    );

    // Wait for shutdown signal
    shutdown_signal().await;

    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;

    log::info!("Shutdown complete");
    Ok(())
}

/// Restarts the latest stored version of every persisted workflow.
async fn redeploy_persisted(services: &BootstrappedServices) {
    let stored = match services.persistence.latest_workflows() {
        Ok(stored) => stored,
        Err(err) => {
            log::error!("Failed to list persisted workflows: {err}");
            return;
        }
    };
    for doc in stored {
        let id = doc.id.clone();
        match services.engine.start(&id).await {
            Ok(()) => log::info!("Workflow {id} restarted from store"),
            Err(err) => log::error!("Workflow {id} failed to restart: {err}"),
        }
    }
}

/// Deploys every workflow document found in a directory.
async fn deploy_from_dir(services: &BootstrappedServices, dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            log::error!("Cannot read workflows dir {}: {err}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        let parsed: Result<overwatch_core::WorkflowDoc> =
            match path.extension().and_then(|e| e.to_str()) {
                Some("json") => std::fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|s| serde_json::from_str(&s).map_err(anyhow::Error::from)),
                Some("yaml") | Some("yml") => std::fs::read_to_string(&path)
                    .map_err(anyhow::Error::from)
                    .and_then(|s| {
                        overwatch_core::graph::workflow_from_yaml(&s).map_err(anyhow::Error::from)
                    }),
                _ => continue,
            };

        match parsed {
            Ok(doc) => {
                let id = doc.id.clone();
                match services.engine.deploy(doc).await {
                    Ok(()) => log::info!("Workflow {id} deployed from {}", path.display()),
                    Err(err) => log::error!("Workflow {id} rejected: {err}"),
                }
            }
            Err(err) => log::error!("Skipping {}: {err}", path.display()),
        }
    }
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
