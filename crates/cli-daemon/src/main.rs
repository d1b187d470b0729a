//! CLI entry point for the seed daemon
//!
//! Parses command line arguments, wires the pipeline and runs until Ctrl-C.

use clap::Parser;
use seed_daemon::{
    run_query_server, Config, Daemon, InboxSink, InboxWatcher, JsonlStore, LogSink, MemoryEngine,
    ShutdownMode, StatusSink,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Seed Daemon - publish incoming files as torrents and seed them indefinitely
#[derive(Parser, Debug)]
#[command(name = "seed-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Abort in-flight jobs on Ctrl-C instead of letting them finish
    #[arg(long, default_value = "false")]
    cancel_on_exit: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "Seed daemon starting");

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let engine = Arc::new(MemoryEngine::new());
    let store = Arc::new(JsonlStore::new(config.paths.store_path.clone()));
    let sink: Arc<dyn StatusSink> = match &config.paths.inbox_dir {
        Some(inbox) => Arc::new(InboxSink::new(
            inbox.clone(),
            config.inbox.remove_after_publish,
            Arc::new(LogSink),
        )),
        None => Arc::new(LogSink),
    };

    let daemon = match Daemon::with_config(config, engine, store, sink) {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!(error = %e, "Failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.start().await {
        error!(error = %e, "Failed to start pipeline");
        return ExitCode::FAILURE;
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if daemon.config.server.enabled {
        let bind = daemon.config.server.bind.clone();
        let server_daemon = daemon.clone();
        let rx = stop_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_query_server(server_daemon, &bind, rx).await {
                error!(error = %e, "Query server stopped");
            }
        }));
    }

    if let Some(inbox) = daemon.config.paths.inbox_dir.clone() {
        let interval = Duration::from_secs(daemon.config.inbox.scan_interval_secs.max(1));
        let watcher = InboxWatcher::new(daemon.clone(), inbox, interval);
        tasks.push(tokio::spawn(watcher.run(stop_rx.clone())));
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C, shutting down");
    }

    stop_tx.send_replace(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    let mode = if args.cancel_on_exit {
        ShutdownMode::Cancel
    } else {
        ShutdownMode::Drain
    };
    daemon.shutdown(mode).await;

    ExitCode::SUCCESS
}
