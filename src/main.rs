use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use content_sync::assets::{AssetFetcher, HttpAssetDownloader};
use content_sync::config;
use content_sync::db;
use content_sync::remote::{HttpRemote, StaticIdentity};
use content_sync::service::ContentService;
use content_sync::sync::SyncEngine;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let remote = Arc::new(HttpRemote::new(&cfg.server.base_url, cfg.server.token.clone())?);
    let fetcher = Arc::new(AssetFetcher::new(
        pool.clone(),
        Arc::new(HttpAssetDownloader::new()?),
        cfg.media_dir(),
        cfg.assets.max_concurrent_downloads,
    ));
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        fetcher,
        remote.clone(),
        remote.clone(),
        Arc::new(StaticIdentity::new(cfg.server.user_id.clone())),
    ));

    engine.reconcile_interrupted_downloads().await?;

    let stale_after = chrono::Duration::seconds(i64::try_from(cfg.app.stale_after_seconds)?);
    let service = Arc::new(ContentService::new(engine, remote, stale_after));

    // Wake every interval; pull only once the cache has gone stale.
    let worker = Arc::clone(&service);
    let interval = Duration::from_millis(cfg.app.sync_interval_ms);
    tokio::spawn(async move {
        loop {
            match worker.refresh_if_stale().await {
                Ok(Some(outcome)) if outcome.anonymous => {
                    warn!("no server.user_id configured; sync idle");
                }
                Ok(Some(outcome)) => {
                    if let Some(err) = outcome.outbox_error {
                        warn!(error = %err, "outbox drain halted");
                    }
                }
                Ok(None) => {}
                Err(err) => error!(error = %err, "sync cycle failed"),
            }
            tokio::time::sleep(interval).await;
        }
    });

    info!(base_url = %cfg.server.base_url, "content sync daemon running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
