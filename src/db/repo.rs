use super::model::{SyncState, UnitListQuery, UnitScope};
use crate::error::{Error, Result};
use crate::model::{
    AssetStatus, AssetType, CacheMode, CacheModeCounts, CachedAsset, CachedLesson, CachedUnit,
    DownloadStatus, NewOutboxRecord, OpaqueBlob, OutboxRecord, UnitDetail,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;
pub type Tx<'a> = Transaction<'a, Sqlite>;

const UNIT_COLUMNS: &str = "id, title, description, learner_level, is_global, updated_at, \
     schema_version, cache_mode, download_status, downloaded_at, synced_at, unit_payload, \
     payload_schema_version";

const LESSON_COLUMNS: &str = "id, unit_id, title, position, payload, updated_at, schema_version";

const ASSET_COLUMNS: &str = "id, unit_id, asset_type, remote_uri, checksum, updated_at, status, \
     local_path, downloaded_at, last_error";

const OUTBOX_COLUMNS: &str =
    "id, idempotency_key, endpoint, method, payload, headers, enqueued_at, attempts, last_error";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// A private in-memory cache with migrations applied. A single long-lived
/// connection backs it, since every SQLite memory connection is its own
/// database.
pub async fn open_in_memory() -> Result<Pool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Expand a leading `~/` in file-backed SQLite URLs and make sure the parent
/// directory exists. Memory URLs and other schemes pass through unchanged.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path_part.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn parse_column<T>(raw: &str, parse: fn(&str) -> Option<T>, column: &str) -> Result<T> {
    parse(raw).ok_or_else(|| Error::Corrupt(format!("unknown {} value '{}'", column, raw)))
}

fn unit_from_row(row: &SqliteRow) -> Result<CachedUnit> {
    let cache_mode: String = row.try_get("cache_mode")?;
    let download_status: String = row.try_get("download_status")?;
    Ok(CachedUnit {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        learner_level: row.try_get("learner_level")?,
        is_global: row.try_get("is_global")?,
        updated_at: row.try_get("updated_at")?,
        schema_version: row.try_get("schema_version")?,
        cache_mode: parse_column(&cache_mode, CacheMode::parse, "cache_mode")?,
        download_status: parse_column(&download_status, DownloadStatus::parse, "download_status")?,
        downloaded_at: row.try_get("downloaded_at")?,
        synced_at: row.try_get("synced_at")?,
        unit_payload: OpaqueBlob::new(
            row.try_get("payload_schema_version")?,
            row.try_get::<String, _>("unit_payload")?,
        ),
    })
}

fn lesson_from_row(row: &SqliteRow) -> Result<CachedLesson> {
    let schema_version: i64 = row.try_get("schema_version")?;
    Ok(CachedLesson {
        id: row.try_get("id")?,
        unit_id: row.try_get("unit_id")?,
        title: row.try_get("title")?,
        position: row.try_get("position")?,
        payload: OpaqueBlob::new(schema_version, row.try_get::<String, _>("payload")?),
        updated_at: row.try_get("updated_at")?,
        schema_version,
    })
}

fn asset_from_row(row: &SqliteRow) -> Result<CachedAsset> {
    let asset_type: String = row.try_get("asset_type")?;
    let status: String = row.try_get("status")?;
    Ok(CachedAsset {
        id: row.try_get("id")?,
        unit_id: row.try_get("unit_id")?,
        asset_type: parse_column(&asset_type, AssetType::parse, "asset_type")?,
        remote_uri: row.try_get("remote_uri")?,
        checksum: row.try_get("checksum")?,
        updated_at: row.try_get("updated_at")?,
        status: parse_column(&status, AssetStatus::parse, "asset status")?,
        local_path: row.try_get("local_path")?,
        downloaded_at: row.try_get("downloaded_at")?,
        last_error: row.try_get("last_error")?,
    })
}

fn outbox_from_row(row: &SqliteRow) -> Result<OutboxRecord> {
    let payload: String = row.try_get("payload")?;
    let headers: String = row.try_get("headers")?;
    Ok(OutboxRecord {
        id: row.try_get("id")?,
        endpoint: row.try_get("endpoint")?,
        method: row.try_get("method")?,
        payload: serde_json::from_str(&payload)?,
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers)?,
        idempotency_key: row.try_get("idempotency_key")?,
        enqueued_at: row.try_get("enqueued_at")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
    })
}

// ---------------------------------------------------------------------------
// Units

#[instrument(skip_all)]
pub async fn get_unit(pool: &Pool, unit_id: &str) -> Result<Option<CachedUnit>> {
    let row = sqlx::query(&format!("SELECT {} FROM units WHERE id = ?", UNIT_COLUMNS))
        .bind(unit_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(unit_from_row).transpose()
}

pub async fn get_unit_tx(tx: &mut Tx<'_>, unit_id: &str) -> Result<Option<CachedUnit>> {
    let row = sqlx::query(&format!("SELECT {} FROM units WHERE id = ?", UNIT_COLUMNS))
        .bind(unit_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.as_ref().map(unit_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_units(pool: &Pool, query: &UnitListQuery) -> Result<Vec<CachedUnit>> {
    let filter = match query.scope {
        UnitScope::All => "",
        UnitScope::Global => "WHERE is_global = 1",
        UnitScope::Personal => "WHERE is_global = 0",
    };
    let rows = sqlx::query(&format!(
        "SELECT {} FROM units {} ORDER BY title ASC, id ASC LIMIT ? OFFSET ?",
        UNIT_COLUMNS, filter
    ))
    .bind(query.limit.max(0))
    .bind(query.offset.max(0))
    .fetch_all(pool)
    .await?;
    rows.iter().map(unit_from_row).collect()
}

pub async fn count_units(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM units")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn upsert_units(pool: &Pool, units: &[CachedUnit]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for unit in units {
        upsert_unit_tx(&mut tx, unit).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_unit_tx(tx: &mut Tx<'_>, unit: &CachedUnit) -> Result<()> {
    sqlx::query(
        "INSERT INTO units (id, title, description, learner_level, is_global, updated_at, \
             schema_version, cache_mode, download_status, downloaded_at, synced_at, unit_payload, \
             payload_schema_version) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             title = excluded.title, description = excluded.description, \
             learner_level = excluded.learner_level, is_global = excluded.is_global, \
             updated_at = excluded.updated_at, schema_version = excluded.schema_version, \
             cache_mode = excluded.cache_mode, download_status = excluded.download_status, \
             downloaded_at = excluded.downloaded_at, synced_at = excluded.synced_at, \
             unit_payload = excluded.unit_payload, \
             payload_schema_version = excluded.payload_schema_version",
    )
    .bind(&unit.id)
    .bind(&unit.title)
    .bind(&unit.description)
    .bind(&unit.learner_level)
    .bind(unit.is_global)
    .bind(unit.updated_at)
    .bind(unit.schema_version)
    .bind(unit.cache_mode.as_str())
    .bind(unit.download_status.as_str())
    .bind(unit.downloaded_at)
    .bind(unit.synced_at)
    .bind(&unit.unit_payload.body)
    .bind(unit.unit_payload.schema_version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Set the local-intent fields of a unit. Returns false if the unit is absent.
#[instrument(skip_all)]
pub async fn set_unit_download_state(
    pool: &Pool,
    unit_id: &str,
    cache_mode: CacheMode,
    download_status: DownloadStatus,
    downloaded_at: Option<DateTime<Utc>>,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE units SET cache_mode = ?, download_status = ?, downloaded_at = ? WHERE id = ?",
    )
    .bind(cache_mode.as_str())
    .bind(download_status.as_str())
    .bind(downloaded_at)
    .bind(unit_id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Persist a demotion to `minimal`: new local-intent fields, no lessons, and
/// assets back to `idle` without local copies. All or nothing.
#[instrument(skip_all)]
pub async fn demote_unit(pool: &Pool, unit: &CachedUnit) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "UPDATE units SET cache_mode = ?, download_status = ?, downloaded_at = ? WHERE id = ?",
    )
    .bind(unit.cache_mode.as_str())
    .bind(unit.download_status.as_str())
    .bind(unit.downloaded_at)
    .bind(&unit.id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM lessons WHERE unit_id = ?")
        .bind(&unit.id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "UPDATE assets SET status = 'idle', local_path = NULL, downloaded_at = NULL, \
         last_error = NULL WHERE unit_id = ?",
    )
    .bind(&unit.id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

/// Remove a unit along with its lessons and assets.
#[instrument(skip_all)]
pub async fn delete_unit(pool: &Pool, unit_id: &str) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let deleted = delete_unit_tx(&mut tx, unit_id).await?;
    tx.commit().await?;
    Ok(deleted)
}

pub async fn delete_unit_tx(tx: &mut Tx<'_>, unit_id: &str) -> Result<bool> {
    // Children are removed explicitly; the cascade must not depend on
    // PRAGMA foreign_keys being on for this connection.
    sqlx::query("DELETE FROM lessons WHERE unit_id = ?")
        .bind(unit_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM assets WHERE unit_id = ?")
        .bind(unit_id)
        .execute(&mut **tx)
        .await?;
    let res = sqlx::query("DELETE FROM units WHERE id = ?")
        .bind(unit_id)
        .execute(&mut **tx)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn get_unit_detail(pool: &Pool, unit_id: &str) -> Result<Option<UnitDetail>> {
    let Some(unit) = get_unit(pool, unit_id).await? else {
        return Ok(None);
    };
    let lessons = list_lessons(pool, unit_id).await?;
    let assets = list_assets(pool, unit_id).await?;
    Ok(Some(UnitDetail {
        unit,
        lessons,
        assets,
    }))
}

#[instrument(skip_all)]
pub async fn cache_mode_counts(pool: &Pool) -> Result<CacheModeCounts> {
    let rows = sqlx::query("SELECT cache_mode, COUNT(*) AS n FROM units GROUP BY cache_mode")
        .fetch_all(pool)
        .await?;
    let mut counts = CacheModeCounts::default();
    for row in rows {
        let mode: String = row.try_get("cache_mode")?;
        let n: i64 = row.try_get("n")?;
        match parse_column(&mode, CacheMode::parse, "cache_mode")? {
            CacheMode::Minimal => counts.minimal = n,
            CacheMode::Full => counts.full = n,
        }
    }
    Ok(counts)
}

/// Turn downloads left `pending` by an interrupted process into `failed`.
/// Returns (units, assets) touched.
#[instrument(skip_all)]
pub async fn fail_pending_downloads(pool: &Pool, reason: &str) -> Result<(u64, u64)> {
    let mut tx = pool.begin().await?;
    let units = sqlx::query("UPDATE units SET download_status = 'failed' WHERE download_status = 'pending'")
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let assets = sqlx::query(
        "UPDATE assets SET status = 'failed', last_error = ? WHERE status = 'pending'",
    )
    .bind(reason)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    tx.commit().await?;
    Ok((units, assets))
}

#[instrument(skip_all)]
pub async fn clear_all(pool: &Pool) -> Result<()> {
    let mut tx = pool.begin().await?;
    for table in ["lessons", "assets", "units", "outbox"] {
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query("UPDATE sync_state SET cursor = NULL, last_pulled_at = NULL WHERE id = 1")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lessons

#[instrument(skip_all)]
pub async fn list_lessons(pool: &Pool, unit_id: &str) -> Result<Vec<CachedLesson>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM lessons WHERE unit_id = ? ORDER BY position ASC, id ASC",
        LESSON_COLUMNS
    ))
    .bind(unit_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(lesson_from_row).collect()
}

#[instrument(skip_all)]
pub async fn upsert_lessons(pool: &Pool, lessons: &[CachedLesson]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for lesson in lessons {
        upsert_lesson_tx(&mut tx, lesson).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_lesson_tx(tx: &mut Tx<'_>, lesson: &CachedLesson) -> Result<()> {
    sqlx::query(
        "INSERT INTO lessons (id, unit_id, title, position, payload, updated_at, schema_version) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             unit_id = excluded.unit_id, title = excluded.title, position = excluded.position, \
             payload = excluded.payload, updated_at = excluded.updated_at, \
             schema_version = excluded.schema_version",
    )
    .bind(&lesson.id)
    .bind(&lesson.unit_id)
    .bind(&lesson.title)
    .bind(lesson.position)
    .bind(&lesson.payload.body)
    .bind(lesson.updated_at)
    .bind(lesson.schema_version)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Make `lessons` the complete lesson set of `unit_id`.
pub async fn replace_unit_lessons_tx(
    tx: &mut Tx<'_>,
    unit_id: &str,
    lessons: &[CachedLesson],
) -> Result<()> {
    let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM lessons WHERE unit_id = ?")
        .bind(unit_id)
        .fetch_all(&mut **tx)
        .await?;
    for id in existing {
        if !lessons.iter().any(|l| l.id == id) {
            sqlx::query("DELETE FROM lessons WHERE id = ?")
                .bind(&id)
                .execute(&mut **tx)
                .await?;
        }
    }
    for lesson in lessons {
        upsert_lesson_tx(tx, lesson).await?;
    }
    Ok(())
}

pub async fn delete_lessons_tx(tx: &mut Tx<'_>, lesson_ids: &[String]) -> Result<u64> {
    let mut removed = 0;
    for id in lesson_ids {
        removed += sqlx::query("DELETE FROM lessons WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Assets

#[instrument(skip_all)]
pub async fn list_assets(pool: &Pool, unit_id: &str) -> Result<Vec<CachedAsset>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM assets WHERE unit_id = ? ORDER BY id ASC",
        ASSET_COLUMNS
    ))
    .bind(unit_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(asset_from_row).collect()
}

pub async fn list_assets_tx(tx: &mut Tx<'_>, unit_id: &str) -> Result<Vec<CachedAsset>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM assets WHERE unit_id = ? ORDER BY id ASC",
        ASSET_COLUMNS
    ))
    .bind(unit_id)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(asset_from_row).collect()
}

#[instrument(skip_all)]
pub async fn get_asset(pool: &Pool, asset_id: &str) -> Result<Option<CachedAsset>> {
    let row = sqlx::query(&format!("SELECT {} FROM assets WHERE id = ?", ASSET_COLUMNS))
        .bind(asset_id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(asset_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn upsert_assets(pool: &Pool, assets: &[CachedAsset]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for asset in assets {
        upsert_asset_tx(&mut tx, asset).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn upsert_asset_tx(tx: &mut Tx<'_>, asset: &CachedAsset) -> Result<()> {
    sqlx::query(
        "INSERT INTO assets (id, unit_id, asset_type, remote_uri, checksum, updated_at, status, \
             local_path, downloaded_at, last_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
             unit_id = excluded.unit_id, asset_type = excluded.asset_type, \
             remote_uri = excluded.remote_uri, checksum = excluded.checksum, \
             updated_at = excluded.updated_at, status = excluded.status, \
             local_path = excluded.local_path, downloaded_at = excluded.downloaded_at, \
             last_error = excluded.last_error",
    )
    .bind(&asset.id)
    .bind(&asset.unit_id)
    .bind(asset.asset_type.as_str())
    .bind(&asset.remote_uri)
    .bind(&asset.checksum)
    .bind(asset.updated_at)
    .bind(asset.status.as_str())
    .bind(&asset.local_path)
    .bind(asset.downloaded_at)
    .bind(&asset.last_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn delete_assets_except_tx(
    tx: &mut Tx<'_>,
    unit_id: &str,
    keep: &[String],
) -> Result<u64> {
    let existing: Vec<String> = sqlx::query_scalar("SELECT id FROM assets WHERE unit_id = ?")
        .bind(unit_id)
        .fetch_all(&mut **tx)
        .await?;
    let mut removed = 0;
    for id in existing.iter().filter(|id| !keep.contains(id)) {
        removed += sqlx::query("DELETE FROM assets WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?
            .rows_affected();
    }
    Ok(removed)
}

#[instrument(skip_all)]
pub async fn mark_asset_pending(pool: &Pool, asset_id: &str) -> Result<()> {
    sqlx::query("UPDATE assets SET status = 'pending', last_error = NULL WHERE id = ?")
        .bind(asset_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_asset_completed(
    pool: &Pool,
    asset_id: &str,
    local_path: &str,
    downloaded_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE assets SET status = 'completed', local_path = ?, downloaded_at = ?, \
         last_error = NULL WHERE id = ?",
    )
    .bind(local_path)
    .bind(downloaded_at)
    .bind(asset_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_asset_failed(pool: &Pool, asset_id: &str, error: &str) -> Result<()> {
    sqlx::query("UPDATE assets SET status = 'failed', last_error = ? WHERE id = ?")
        .bind(error)
        .bind(asset_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Outbox

/// Append a record unless one with the same idempotency key is still queued.
/// Returns the new row id, or `None` when the enqueue collapsed.
#[instrument(skip_all)]
pub async fn enqueue_outbox(
    pool: &Pool,
    record: &NewOutboxRecord,
    enqueued_at: DateTime<Utc>,
) -> Result<Option<i64>> {
    let payload = serde_json::to_string(&record.payload)?;
    let headers = serde_json::to_string(&record.headers)?;
    let id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO outbox (idempotency_key, endpoint, method, payload, headers, enqueued_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT(idempotency_key) DO NOTHING RETURNING id",
    )
    .bind(&record.idempotency_key)
    .bind(&record.endpoint)
    .bind(&record.method)
    .bind(payload)
    .bind(headers)
    .bind(enqueued_at)
    .fetch_optional(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn next_outbox(pool: &Pool) -> Result<Option<OutboxRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM outbox ORDER BY id ASC LIMIT 1",
        OUTBOX_COLUMNS
    ))
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(outbox_from_row).transpose()
}

pub async fn list_outbox(pool: &Pool) -> Result<Vec<OutboxRecord>> {
    let rows = sqlx::query(&format!("SELECT {} FROM outbox ORDER BY id ASC", OUTBOX_COLUMNS))
        .fetch_all(pool)
        .await?;
    rows.iter().map(outbox_from_row).collect()
}

#[instrument(skip_all)]
pub async fn delete_outbox(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM outbox WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_outbox_failure(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query("UPDATE outbox SET attempts = attempts + 1, last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn discard_outbox(pool: &Pool, idempotency_key: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM outbox WHERE idempotency_key = ?")
        .bind(idempotency_key)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_outbox(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Sync state

#[instrument(skip_all)]
pub async fn get_sync_state(pool: &Pool) -> Result<SyncState> {
    let row = sqlx::query("SELECT cursor, last_pulled_at FROM sync_state WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(SyncState::default());
    };
    Ok(SyncState {
        cursor: row.try_get("cursor")?,
        last_pulled_at: row.try_get("last_pulled_at")?,
    })
}

pub async fn set_sync_state_tx(tx: &mut Tx<'_>, state: &SyncState) -> Result<()> {
    sqlx::query(
        "INSERT INTO sync_state (id, cursor, last_pulled_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET cursor = excluded.cursor, \
         last_pulled_at = excluded.last_pulled_at",
    )
    .bind(&state.cursor)
    .bind(state.last_pulled_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
