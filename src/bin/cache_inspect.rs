use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use content_sync::config;
use content_sync::db::{self, UnitListQuery, UnitScope};
use content_sync::outbox::Outbox;

#[derive(Parser, Debug)]
#[command(about = "Print the local cache state without touching the network")]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Show this unit's lessons and assets instead of the unit list
    #[arg(long)]
    unit: Option<String>,

    /// Units to list (default: app.page_size)
    #[arg(long)]
    limit: Option<i64>,

    /// Only `global` or `personal` units
    #[arg(long)]
    scope: Option<String>,

    /// List queued outbox records
    #[arg(long)]
    outbox: bool,

    /// Drop the queued record with this idempotency key
    #[arg(long)]
    discard: Option<String>,

    /// Wipe the cache: units, queued writes, cursor and media files
    #[arg(long)]
    clear: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;
    let outbox = Outbox::new(pool.clone());

    if args.clear {
        db::clear_all(&pool).await?;
        let media = cfg.media_dir();
        if media.exists() {
            std::fs::remove_dir_all(&media)?;
        }
        println!("Cache cleared");
        return Ok(());
    }

    if let Some(key) = &args.discard {
        if outbox.discard(key).await? {
            println!("Discarded {}", key);
        } else {
            println!("No queued record with key {}", key);
        }
        return Ok(());
    }

    let state = db::get_sync_state(&pool).await?;
    let counts = db::cache_mode_counts(&pool).await?;
    println!("Cursor: {}", state.cursor.as_deref().unwrap_or("-"));
    println!(
        "Last pulled: {}",
        state
            .last_pulled_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into())
    );
    println!("Units: {} minimal, {} full", counts.minimal, counts.full);
    println!("Pending writes: {}", outbox.pending_count().await?);

    if args.outbox {
        println!("Outbox:");
        for r in outbox.list().await? {
            println!(
                "  #{} {} {} key={} attempts={}{}",
                r.id,
                r.method,
                r.endpoint,
                r.idempotency_key,
                r.attempts,
                r.last_error
                    .map(|e| format!(" last_error={}", e))
                    .unwrap_or_default()
            );
        }
        return Ok(());
    }

    if let Some(unit_id) = &args.unit {
        let Some(detail) = db::get_unit_detail(&pool, unit_id).await? else {
            println!("Unit {} is not cached", unit_id);
            return Ok(());
        };
        let u = &detail.unit;
        println!(
            "{} \"{}\" {}/{} synced {}",
            u.id,
            u.title,
            u.cache_mode.as_str(),
            u.download_status.as_str(),
            u.synced_at.to_rfc3339()
        );
        println!("Lessons:");
        for l in &detail.lessons {
            println!("  {:>3} {} {}", l.position, l.id, l.title);
        }
        println!("Assets:");
        for a in &detail.assets {
            println!(
                "  {} {} {} {}",
                a.id,
                a.asset_type.as_str(),
                a.status.as_str(),
                a.local_path.as_deref().unwrap_or(&a.remote_uri)
            );
        }
        return Ok(());
    }

    let scope = match args.scope.as_deref() {
        Some("global") => UnitScope::Global,
        Some("personal") => UnitScope::Personal,
        Some(other) => anyhow::bail!("unknown scope {}", other),
        None => UnitScope::All,
    };
    let units = db::list_units(
        &pool,
        &UnitListQuery {
            limit: args.limit.unwrap_or(cfg.app.page_size),
            offset: 0,
            scope,
        },
    )
    .await?;
    for u in units {
        println!(
            "{}\t{}\t{}/{}\t{}",
            u.id,
            u.title,
            u.cache_mode.as_str(),
            u.download_status.as_str(),
            if u.is_global { "global" } else { "personal" }
        );
    }
    Ok(())
}
