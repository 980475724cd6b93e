//! CLI entry point for the sync agent.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use labsync_core::{Config, Database, HttpUploader, Layout, TaskStore, Uploader};
use tracing::{debug, info, warn};

mod cli;
mod logging;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    let config = Config::load(&args.config, &exe_dir);
    let portable_mode = args.portable || config.portable_mode;
    let layout = Layout::resolve(portable_mode, &exe_dir);

    let _log_guard = logging::init(&layout.log_path, args.verbose, args.quiet);

    debug!(?args, "CLI arguments parsed");
    info!(watch_dir = %config.watch_dir.display(), "🚀 labsync-agent starting");

    let db = Database::new(&layout.db_path)
        .await
        .context("failed to open task database")?;
    let store = TaskStore::with_max_backoff(db, config.max_backoff_secs);

    let uploader: Arc<dyn Uploader> = Arc::new(
        HttpUploader::new(
            config.api_base_url(),
            config.auth_token.clone(),
            config.instrument_alias.clone(),
            config.max_retries,
            config.chunk_size_bytes,
        )
        .context("failed to build uploader HTTP client")?,
    );

    match args.command {
        Some(Command::Rescan) => {
            let (scanned, enqueued) =
                labsync_core::rescan::run(&config.watch_dir, &store, uploader.as_ref()).await;
            info!(scanned, enqueued, "✅ rescan finished");
            Ok(())
        }
        None => run_agent(config.watch_dir.clone(), config.instrument_alias.clone(), store, uploader, &config).await,
    }
}

async fn run_agent(
    watch_dir: std::path::PathBuf,
    machine_id: String,
    store: TaskStore,
    uploader: Arc<dyn Uploader>,
    config: &Config,
) -> Result<()> {
    std::fs::create_dir_all(&watch_dir).context("failed to create watch directory")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let (_fs_watcher, raw_events) = labsync_core::watcher::spawn_bridge(&watch_dir)
        .context("failed to start filesystem watcher")?;

    let (stable_tx, mut stable_rx) = tokio::sync::mpsc::channel(256);
    let debouncer = labsync_core::watcher::debounce::Debouncer::new(
        config.stability_wait,
        config.scan_interval,
        stable_tx,
    );

    let debouncer_handle = tokio::spawn(debouncer.clone().run());

    let watcher_store = store.clone();
    let stable_handler_debouncer = debouncer.clone();
    let watcher_handle = tokio::spawn(labsync_core::watcher::run(
        watch_dir.clone(),
        machine_id,
        raw_events,
        watcher_store,
        debouncer,
    ));

    let stable_handler_root = watch_dir.clone();
    let stable_handler_store = store.clone();
    let stable_handler_handle = tokio::spawn(async move {
        while let Some(path) = stable_rx.recv().await {
            labsync_core::watcher::handle_stable_path(
                &stable_handler_root,
                &path,
                &stable_handler_store,
                &stable_handler_debouncer,
            )
            .await;
        }
    });

    let worker_handle = tokio::spawn(labsync_core::worker::run(store, uploader, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("🛑 shutdown requested");

    let _ = shutdown_tx.send(true);
    debouncer_handle.abort();
    watcher_handle.abort();
    stable_handler_handle.abort();

    if let Err(err) = worker_handle.await {
        warn!(%err, "worker task did not shut down cleanly");
    }

    Ok(())
}
