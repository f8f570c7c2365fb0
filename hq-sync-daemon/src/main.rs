//! HQ sync daemon
//!
//! Wires the sync engine together: object store backend, upload daemon,
//! download poller, and the status aggregator, then runs until ctrl-c.

mod settings;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use hq_sync::config::StatusConfig;
use hq_sync::daemon::SyncDaemon;
use hq_sync::download_manager::DownloadManager;
use hq_sync::status::StatusAggregator;
use hq_sync::storage::{CliObjectStore, ObjectStore, S3ObjectStore};
use hq_sync::uploader::Uploader;

use settings::Settings;

#[derive(Debug, Parser)]
#[command(name = "hq-sync-daemon", about = "HQ background sync daemon", version)]
struct Args {
    /// Path to the TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the HQ root directory.
    #[arg(long)]
    root: Option<PathBuf>,

    /// Override the bucket name.
    #[arg(long)]
    bucket: Option<String>,

    /// Override the user id.
    #[arg(long)]
    user: Option<String>,

    /// Use the aws CLI subprocess backend instead of the SDK.
    #[arg(long)]
    cli_fallback: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(root) = args.root {
        settings.root_dir = root.clone();
        settings.daemon.root_dir = root.clone();
        settings.download.local_dir = root;
    }
    if let Some(bucket) = args.bucket {
        settings.bucket_name = bucket.clone();
        settings.uploader.bucket_name = bucket.clone();
        settings.download.bucket_name = bucket;
    }
    if let Some(user) = args.user {
        settings.user_id = user.clone();
        settings.uploader.user_id = user.clone();
        settings.download.s3_prefix = format!("{user}/hq/");
    }
    if args.cli_fallback {
        settings.use_cli_fallback = true;
    }

    info!(
        root = %settings.root_dir.display(),
        bucket = %settings.bucket_name,
        user = %settings.user_id,
        "starting hq sync"
    );

    let store: Arc<dyn ObjectStore> = if settings.use_cli_fallback {
        info!("using aws cli object-store backend");
        Arc::new(CliObjectStore::new(&settings.bucket_name, &settings.region))
    } else {
        Arc::new(S3ObjectStore::new(&settings.bucket_name, &settings.region).await)
    };

    let status = Arc::new(StatusAggregator::new(StatusConfig {
        max_recent_errors: settings.status.max_recent_errors,
    }));

    let uploader = Arc::new(Uploader::new(settings.uploader.clone(), store.clone())?);
    let daemon = Arc::new(SyncDaemon::new(
        settings.daemon.clone(),
        uploader,
        Some(status.clone()),
    )?);
    let manager = Arc::new(
        DownloadManager::new(
            settings.download.clone(),
            store,
            &settings.user_id,
            settings.conflict.clone(),
            Some(status.clone()),
        )
        .await?,
    );

    daemon.start().await.context("starting sync daemon")?;
    manager.start_polling();

    // Periodic observability dump; the aggregator snapshot is the same
    // document the HTTP layer serves.
    let status_for_dump = status.clone();
    let dump_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Ok(rendered) = serde_json::to_string(&status_for_dump.snapshot()) {
                debug!(status = %rendered, "sync status");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    dump_task.abort();
    manager.stop_polling().await;
    daemon.stop().await?;

    let final_status = status.snapshot();
    info!(
        uploaded = final_status.upload.total_files_uploaded,
        downloaded = final_status.download.total_files_downloaded,
        errors = final_status.recent_errors.len(),
        "shutdown complete"
    );
    Ok(())
}
