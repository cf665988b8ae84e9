//! Sync engine: reconciles the local cache with the server and owns the
//! per-unit cache-mode transitions.
//!
//! A cycle resolves the acting user, pulls changes since the stored cursor,
//! applies the whole response in one transaction, and then drains the
//! outbox. Cycles on one engine never overlap: a caller arriving while a
//! cycle is in flight waits for it, and reuses its outcome when that cycle
//! already covered what the caller asked for.
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::assets::{AssetDownloadReport, AssetFetcher};
use crate::db::{self, Pool, SyncState, Tx};
use crate::error::{validate_id, Error, Result};
use crate::model::{CachedUnit, PayloadMode, SyncResult, SyncStatus};
use crate::outbox::{DrainReport, Outbox};
use crate::remote::model::{PullRequest, PullResponse, ServerUnitEntry};
use crate::remote::{IdentityProvider, OutboxProcessor, PullTransport};

pub mod merge;
pub mod state;

use state::{transition, CacheTransition};

/// What a sync cycle should pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub payload: PayloadMode,
    /// Ignore the stored cursor and request the full corpus.
    pub force: bool,
    /// Restrict the pull to these units; empty means every unit.
    pub unit_ids: Vec<String>,
}

impl SyncOptions {
    pub fn minimal() -> Self {
        Self {
            payload: PayloadMode::Minimal,
            force: false,
            unit_ids: Vec::new(),
        }
    }

    pub fn full() -> Self {
        Self {
            payload: PayloadMode::Full,
            ..Self::minimal()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn for_units(mut self, unit_ids: Vec<String>) -> Self {
        self.unit_ids = unit_ids;
        self
    }

    fn is_scoped(&self) -> bool {
        !self.unit_ids.is_empty()
    }

    /// Whether a finished cycle run with `done` already gave this request
    /// everything it would have fetched.
    pub fn covered_by(&self, done: &SyncOptions) -> bool {
        let force_ok = !self.force || done.force;
        let payload_ok = self.payload == PayloadMode::Minimal || done.payload == PayloadMode::Full;
        let scope_ok = !done.is_scoped()
            || (self.is_scoped() && self.unit_ids.iter().all(|id| done.unit_ids.contains(id)));
        force_ok && payload_ok && scope_ok
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::minimal()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    /// No acting user; nothing was pulled.
    pub anonymous: bool,
    /// The outcome of an in-flight cycle this call waited on.
    pub coalesced: bool,
    pub units_applied: usize,
    pub lessons_applied: usize,
    pub assets_applied: usize,
    pub units_deleted: usize,
    pub lessons_deleted: u64,
    pub cursor: Option<String>,
    pub outbox: Option<DrainReport>,
    pub outbox_error: Option<String>,
}

#[derive(Debug, Default)]
struct RunStatus {
    last_attempt: Option<chrono::DateTime<Utc>>,
    result: SyncResult,
    error: Option<String>,
}

/// A download whose unit is already `full`/`pending`; the handle resolves
/// once lessons and assets have been fetched.
#[derive(Debug)]
pub struct PendingDownload {
    pub unit: CachedUnit,
    pub handle: JoinHandle<Result<AssetDownloadReport>>,
}

pub struct SyncEngine {
    pool: Pool,
    outbox: Arc<Outbox>,
    fetcher: Arc<AssetFetcher>,
    pull: Arc<dyn PullTransport>,
    push: Arc<dyn OutboxProcessor>,
    identity: Arc<dyn IdentityProvider>,
    cycle_lock: Mutex<()>,
    completed_cycles: AtomicU64,
    last_cycle: Mutex<Option<(SyncOptions, SyncOutcome)>>,
    run_status: Mutex<RunStatus>,
}

impl SyncEngine {
    pub fn new(
        pool: Pool,
        fetcher: Arc<AssetFetcher>,
        pull: Arc<dyn PullTransport>,
        push: Arc<dyn OutboxProcessor>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            outbox: Arc::new(Outbox::new(pool.clone())),
            pool,
            fetcher,
            pull,
            push,
            identity,
            cycle_lock: Mutex::new(()),
            completed_cycles: AtomicU64::new(0),
            last_cycle: Mutex::new(None),
            run_status: Mutex::new(RunStatus::default()),
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn fetcher(&self) -> &Arc<AssetFetcher> {
        &self.fetcher
    }

    /// Run one pull + outbox drain cycle.
    #[instrument(skip(self), fields(payload = options.payload.as_str(), force = options.force))]
    pub async fn run_sync_cycle(&self, options: &SyncOptions) -> Result<SyncOutcome> {
        let observed = self.completed_cycles.load(Ordering::Acquire);
        let _cycle = self.cycle_lock.lock().await;

        if self.completed_cycles.load(Ordering::Acquire) != observed {
            if let Some((done, outcome)) = self.last_cycle.lock().await.as_ref() {
                if options.covered_by(done) {
                    debug!("reusing outcome of the cycle we waited on");
                    return Ok(SyncOutcome {
                        coalesced: true,
                        ..outcome.clone()
                    });
                }
            }
        }

        self.run_cycle_locked(options).await
    }

    async fn run_cycle_locked(&self, options: &SyncOptions) -> Result<SyncOutcome> {
        let Some(user_id) = self.identity.user_id().await else {
            debug!("no acting user; skipping sync");
            return Ok(SyncOutcome {
                anonymous: true,
                ..Default::default()
            });
        };

        self.run_status.lock().await.last_attempt = Some(Utc::now());

        let mut outcome = match self.pull_and_apply(options).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "sync pull failed; cache left as is");
                let mut status = self.run_status.lock().await;
                status.result = SyncResult::Error;
                status.error = Some(err.to_string());
                return Err(err);
            }
        };

        match self.outbox.process(self.push.as_ref()).await {
            Ok(report) => {
                if let Some(failure) = &report.failure {
                    outcome.outbox_error = Some(failure.error.clone());
                }
                outcome.outbox = Some(report);
            }
            Err(err) => {
                warn!(error = %err, "outbox drain failed after pull");
                outcome.outbox_error = Some(err.to_string());
            }
        }

        {
            let mut status = self.run_status.lock().await;
            status.result = SyncResult::Success;
            status.error = None;
        }
        *self.last_cycle.lock().await = Some((options.clone(), outcome.clone()));
        self.completed_cycles.fetch_add(1, Ordering::AcqRel);

        info!(
            user_id = %user_id,
            units = outcome.units_applied,
            lessons = outcome.lessons_applied,
            deleted = outcome.units_deleted,
            pending_writes = outcome.outbox.as_ref().map(|r| r.remaining).unwrap_or_default(),
            "sync cycle complete"
        );
        Ok(outcome)
    }

    async fn pull_and_apply(&self, options: &SyncOptions) -> Result<SyncOutcome> {
        let previous = db::get_sync_state(&self.pool).await?;
        let request = PullRequest {
            cursor: if options.force {
                None
            } else {
                previous.cursor.clone()
            },
            payload: options.payload,
            force: options.force,
            unit_ids: options.unit_ids.clone(),
        };

        let response = self
            .pull
            .pull(&request)
            .await
            .map_err(|err| Error::network(err.context("pull failed")))?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut outcome = apply_pull(&mut tx, &response, options.payload, now).await?;

        // A scoped pull only saw part of the corpus; moving the shared
        // cursor past it would skip changes to every other unit.
        let cursor = if options.is_scoped() {
            previous.cursor.clone()
        } else {
            response.cursor.clone().or(previous.cursor.clone())
        };
        let last_pulled_at = if options.is_scoped() {
            previous.last_pulled_at
        } else {
            Some(now)
        };
        db::set_sync_state_tx(
            &mut tx,
            &SyncState {
                cursor: cursor.clone(),
                last_pulled_at,
            },
        )
        .await?;
        tx.commit().await?;
        outcome.cursor = cursor;

        for unit_id in &response.deleted_unit_ids {
            let _gate = self.fetcher.lock_unit(unit_id).await;
            if let Err(err) = self.fetcher.remove_unit_files(unit_id).await {
                warn!(unit_id = %unit_id, error = %err, "failed to remove media of deleted unit");
            }
        }
        Ok(outcome)
    }

    /// Deliver queued mutations outside a sync cycle.
    pub async fn drain_outbox(&self) -> Result<DrainReport> {
        self.outbox.process(self.push.as_ref()).await
    }

    /// Mark a unit `full`/`pending`. A unit not cached yet is pulled first.
    #[instrument(skip(self))]
    pub async fn begin_unit_download(&self, unit_id: &str) -> Result<CachedUnit> {
        validate_id("unit", unit_id)?;
        let unit = match db::get_unit(&self.pool, unit_id).await? {
            Some(unit) => unit,
            None => {
                let options = SyncOptions::minimal()
                    .forced()
                    .for_units(vec![unit_id.to_string()]);
                self.run_sync_cycle(&options).await?;
                db::get_unit(&self.pool, unit_id)
                    .await?
                    .ok_or_else(|| Error::NotFound(unit_id.to_string()))?
            }
        };

        let next = transition(&unit, CacheTransition::RequestDownload, Utc::now())?;
        db::set_unit_download_state(
            &self.pool,
            unit_id,
            next.cache_mode,
            next.download_status,
            next.downloaded_at,
        )
        .await?;
        info!(unit_id, from = unit.cache_mode.as_str(), "unit download requested");
        Ok(next)
    }

    /// Pull the unit's lessons, then fetch its assets. A failed pull leaves
    /// the unit `failed` so the caller can offer a retry.
    ///
    /// The pull ignores the cursor: an unchanged unit would otherwise come
    /// back empty and the download would complete without lessons. Assets
    /// that fail individually are listed in the report; see
    /// [`AssetDownloadReport::errors`].
    #[instrument(skip(self))]
    pub async fn complete_unit_download(&self, unit_id: &str) -> Result<AssetDownloadReport> {
        validate_id("unit", unit_id)?;
        let options = SyncOptions::full()
            .forced()
            .for_units(vec![unit_id.to_string()]);
        match self.run_sync_cycle(&options).await {
            Ok(outcome) if outcome.anonymous => {
                self.fail_download(unit_id).await?;
                return Err(Error::Validation(
                    "downloading a unit needs a signed-in user".into(),
                ));
            }
            Ok(_) => {}
            Err(err) => {
                self.fail_download(unit_id).await?;
                return Err(err);
            }
        }
        match self.fetcher.download_unit_assets(unit_id).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.fail_download(unit_id).await?;
                Err(err)
            }
        }
    }

    /// `begin_unit_download` now, the rest in the background.
    pub async fn request_unit_download(self: &Arc<Self>, unit_id: &str) -> Result<PendingDownload> {
        let unit = self.begin_unit_download(unit_id).await?;
        let engine = Arc::clone(self);
        let id = unit_id.to_string();
        let handle = tokio::spawn(async move {
            let result = engine.complete_unit_download(&id).await;
            if let Err(err) = &result {
                warn!(unit_id = %id, error = %err, "unit download failed");
            }
            result
        });
        Ok(PendingDownload { unit, handle })
    }

    async fn fail_download(&self, unit_id: &str) -> Result<()> {
        if let Some(unit) = db::get_unit(&self.pool, unit_id).await? {
            if let Ok(next) = transition(&unit, CacheTransition::DownloadFailed, Utc::now()) {
                db::set_unit_download_state(
                    &self.pool,
                    unit_id,
                    next.cache_mode,
                    next.download_status,
                    next.downloaded_at,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Demote a unit to `minimal`: lessons and local media go, metadata stays.
    #[instrument(skip(self))]
    pub async fn remove_unit_download(&self, unit_id: &str) -> Result<CachedUnit> {
        validate_id("unit", unit_id)?;
        let _cycle = self.cycle_lock.lock().await;
        let unit = db::get_unit(&self.pool, unit_id)
            .await?
            .ok_or_else(|| Error::NotFound(unit_id.to_string()))?;
        let next = transition(&unit, CacheTransition::RemoveDownload, Utc::now())?;
        let _gate = self.fetcher.lock_unit(unit_id).await;
        db::demote_unit(&self.pool, &next).await?;
        self.fetcher.remove_unit_files(unit_id).await?;
        info!(unit_id, "unit download removed");
        Ok(next)
    }

    /// Drop a unit and everything it owns from the cache.
    #[instrument(skip(self))]
    pub async fn delete_unit(&self, unit_id: &str) -> Result<bool> {
        validate_id("unit", unit_id)?;
        let _cycle = self.cycle_lock.lock().await;
        let _gate = self.fetcher.lock_unit(unit_id).await;
        let deleted = db::delete_unit(&self.pool, unit_id).await?;
        self.fetcher.remove_unit_files(unit_id).await?;
        if deleted {
            info!(unit_id, "unit removed from cache");
        }
        Ok(deleted)
    }

    /// Store a unit fetched outside the sync protocol as a `minimal` record.
    /// An already cached unit keeps its local intent.
    #[instrument(skip_all, fields(unit_id = %entry.summary.id))]
    pub async fn seed_minimal(&self, entry: &ServerUnitEntry) -> Result<CachedUnit> {
        validate_id("unit", &entry.summary.id)?;
        let _cycle = self.cycle_lock.lock().await;
        let summary_only = ServerUnitEntry {
            summary: entry.summary.clone(),
            lessons: Vec::new(),
            assets: entry.assets.clone(),
        };
        let response = PullResponse {
            units: vec![summary_only],
            ..Default::default()
        };
        let mut tx = self.pool.begin().await?;
        apply_pull(&mut tx, &response, PayloadMode::Minimal, Utc::now()).await?;
        tx.commit().await?;
        db::get_unit(&self.pool, &entry.summary.id)
            .await?
            .ok_or_else(|| Error::NotFound(entry.summary.id.clone()))
    }

    /// Startup recovery: downloads left `pending` by a previous process are
    /// marked `failed`; they are retried only when the user asks again.
    pub async fn reconcile_interrupted_downloads(&self) -> Result<(u64, u64)> {
        let (units, assets) = db::fail_pending_downloads(&self.pool, "interrupted").await?;
        if units > 0 || assets > 0 {
            warn!(units, assets, "marked interrupted downloads as failed");
        }
        Ok((units, assets))
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let state = db::get_sync_state(&self.pool).await?;
        let pending_writes = self.outbox.pending_count().await?;
        let cache_mode_counts = db::cache_mode_counts(&self.pool).await?;
        let run = self.run_status.lock().await;
        Ok(SyncStatus {
            last_pulled_at: state.last_pulled_at,
            last_cursor: state.cursor,
            pending_writes,
            cache_mode_counts,
            last_sync_attempt: run.last_attempt,
            last_sync_result: run.result,
            last_sync_error: run.error.clone(),
        })
    }
}

/// Write a pull response into the cache inside `tx`.
async fn apply_pull(
    tx: &mut Tx<'_>,
    response: &PullResponse,
    requested: PayloadMode,
    now: chrono::DateTime<Utc>,
) -> Result<SyncOutcome> {
    let mut outcome = SyncOutcome::default();

    for entry in &response.units {
        let unit_id = entry.summary.id.as_str();
        if unit_id.trim().is_empty() {
            warn!("skipping pulled unit without id");
            continue;
        }
        let existing = db::get_unit_tx(tx, unit_id).await?;
        let existing_assets = match existing {
            Some(_) => db::list_assets_tx(tx, unit_id).await?,
            None => Vec::new(),
        };
        let merged =
            merge::merge_entry(existing.as_ref(), &existing_assets, entry, requested, now)?;

        db::upsert_unit_tx(tx, &merged.unit).await?;
        outcome.units_applied += 1;

        if let Some(lessons) = &merged.lessons {
            db::replace_unit_lessons_tx(tx, unit_id, lessons).await?;
            outcome.lessons_applied += lessons.len();
        }
        if let Some(assets) = &merged.assets {
            for asset in assets {
                db::upsert_asset_tx(tx, asset).await?;
            }
            let keep: Vec<String> = assets.iter().map(|a| a.id.clone()).collect();
            db::delete_assets_except_tx(tx, unit_id, &keep).await?;
            outcome.assets_applied += assets.len();
        }
    }

    for unit_id in &response.deleted_unit_ids {
        if db::delete_unit_tx(tx, unit_id).await? {
            outcome.units_deleted += 1;
        }
    }
    outcome.lessons_deleted = db::delete_lessons_tx(tx, &response.deleted_lesson_ids).await?;

    Ok(outcome)
}
