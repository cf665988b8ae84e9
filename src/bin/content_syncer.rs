use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use content_sync::assets::{AssetFetcher, HttpAssetDownloader};
use content_sync::config;
use content_sync::db;
use content_sync::model::PayloadMode;
use content_sync::remote::{HttpRemote, StaticIdentity};
use content_sync::sync::{SyncEngine, SyncOptions};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run one sync cycle, drain the outbox and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Request lesson bodies, not just unit summaries
    #[arg(long)]
    full: bool,

    /// Ignore the stored cursor and pull the whole corpus
    #[arg(long)]
    force: bool,

    /// Restrict the pull to these unit ids (repeatable)
    #[arg(long = "unit")]
    units: Vec<String>,

    /// Also download the assets of every --unit
    #[arg(long, requires = "units")]
    download: bool,

    /// Only deliver queued writes; skip the pull
    #[arg(long, conflicts_with_all = ["full", "force", "units", "download"])]
    drain_only: bool,
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
    let engine = SyncEngine::new(
        pool.clone(),
        fetcher,
        remote.clone(),
        remote,
        Arc::new(StaticIdentity::new(cfg.server.user_id.clone())),
    );
    engine.reconcile_interrupted_downloads().await?;

    if args.drain_only {
        let report = engine.drain_outbox().await?;
        info!(processed = report.processed, remaining = report.remaining, "outbox drained");
        if let Some(failure) = report.failure {
            bail!("outbox halted at {}: {}", failure.idempotency_key, failure.error);
        }
        return Ok(());
    }

    let mut options = SyncOptions {
        payload: if args.full || args.download {
            PayloadMode::Full
        } else {
            PayloadMode::Minimal
        },
        ..SyncOptions::default()
    }
    .for_units(args.units.clone());
    if args.force {
        options = options.forced();
    }

    let outcome = engine.run_sync_cycle(&options).await?;
    if outcome.anonymous {
        warn!("no server.user_id configured; nothing pulled");
        return Ok(());
    }
    info!(
        units = outcome.units_applied,
        lessons = outcome.lessons_applied,
        assets = outcome.assets_applied,
        units_deleted = outcome.units_deleted,
        lessons_deleted = outcome.lessons_deleted,
        cursor = outcome.cursor.as_deref().unwrap_or("-"),
        "sync complete"
    );

    let mut failed = 0usize;
    if args.download {
        for unit_id in &args.units {
            engine.begin_unit_download(unit_id).await?;
            match engine.complete_unit_download(unit_id).await {
                Ok(report) if report.is_success() => info!(
                    unit_id = %unit_id,
                    completed = report.completed.len(),
                    skipped = report.skipped.len(),
                    "unit downloaded"
                ),
                Ok(report) => {
                    failed += 1;
                    for err in report.errors() {
                        error!(unit_id = %unit_id, error = %err, "asset failed");
                    }
                }
                Err(err) => {
                    failed += 1;
                    error!(unit_id = %unit_id, error = %err, "unit download failed");
                }
            }
        }
    }

    if let Some(err) = outcome.outbox_error {
        bail!("outbox halted: {}", err);
    }
    if failed > 0 {
        bail!("{} unit download(s) incomplete", failed);
    }
    Ok(())
}
