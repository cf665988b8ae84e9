//! Caller-facing content API. Reads are served from the local cache; the
//! network is touched only when the cache is cold, stale, inconsistent or a
//! mutation needs authoritative confirmation.
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool, UnitListQuery};
use crate::error::{validate_id, Error, Result};
use crate::model::{CachedUnit, NewOutboxRecord, SyncStatus, UnitDetail};
use crate::outbox::EnqueueOutcome;
use crate::remote::model::SharingUpdate;
use crate::remote::ContentRepo;
use crate::sync::{PendingDownload, SyncEngine, SyncOptions, SyncOutcome};

pub struct ContentService {
    engine: Arc<SyncEngine>,
    repo: Arc<dyn ContentRepo>,
    pool: Pool,
    stale_after: Duration,
}

impl ContentService {
    pub fn new(engine: Arc<SyncEngine>, repo: Arc<dyn ContentRepo>, stale_after: Duration) -> Self {
        Self {
            pool: engine.pool().clone(),
            engine,
            repo,
            stale_after,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Cached units in title order. An empty cache is filled by a sync
    /// first; a stale one is refreshed in the background.
    #[instrument(skip(self))]
    pub async fn list_units(&self, query: &UnitListQuery) -> Result<Vec<CachedUnit>> {
        if db::count_units(&self.pool).await? == 0 {
            info!("cache is empty; syncing before first read");
            self.engine.run_sync_cycle(&SyncOptions::minimal()).await?;
        } else if self.is_stale(Utc::now()).await? {
            self.refresh_in_background();
        }
        db::list_units(&self.pool, query).await
    }

    async fn is_stale(&self, now: DateTime<Utc>) -> Result<bool> {
        let state = db::get_sync_state(&self.pool).await?;
        Ok(match state.last_pulled_at {
            Some(at) => now - at > self.stale_after,
            None => true,
        })
    }

    fn refresh_in_background(&self) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(err) = engine.run_sync_cycle(&SyncOptions::minimal()).await {
                warn!(error = %err, "background refresh failed");
            }
        });
    }

    /// Unit with its lessons and assets.
    ///
    /// A unit that claims a completed download but is missing the lessons
    /// its summary lists is re-pulled once. A unit missing from the cache is fetched directly
    /// and stored as a `minimal` record.
    #[instrument(skip(self))]
    pub async fn get_unit_detail(&self, unit_id: &str) -> Result<UnitDetail> {
        validate_id("unit", unit_id)?;

        if let Some(detail) = db::get_unit_detail(&self.pool, unit_id).await? {
            if !needs_repair(&detail) {
                return Ok(detail);
            }
            warn!(unit_id, "downloaded unit is missing its lessons; resyncing");
            let options = SyncOptions::full()
                .forced()
                .for_units(vec![unit_id.to_string()]);
            if let Err(err) = self.engine.run_sync_cycle(&options).await {
                warn!(unit_id, error = %err, "repair sync failed; serving cached unit");
                return Ok(detail);
            }
            return match db::get_unit_detail(&self.pool, unit_id).await? {
                Some(repaired) => Ok(repaired),
                None => Err(Error::NotFound(unit_id.to_string())),
            };
        }

        let entry = self
            .repo
            .fetch_unit_detail(unit_id)
            .await
            .map_err(Error::network)?;
        if entry.summary.id != unit_id {
            return Err(Error::Validation(format!(
                "server returned unit {} for {}",
                entry.summary.id, unit_id
            )));
        }
        self.engine.seed_minimal(&entry).await?;
        info!(unit_id, "seeded minimal unit from direct fetch");
        db::get_unit_detail(&self.pool, unit_id)
            .await?
            .ok_or_else(|| Error::NotFound(unit_id.to_string()))
    }

    pub async fn request_unit_download(&self, unit_id: &str) -> Result<PendingDownload> {
        self.engine.request_unit_download(unit_id).await
    }

    pub async fn remove_unit_download(&self, unit_id: &str) -> Result<CachedUnit> {
        self.engine.remove_unit_download(unit_id).await
    }

    #[instrument(skip(self))]
    pub async fn add_to_my_units(&self, unit_id: &str) -> Result<SyncOutcome> {
        validate_id("unit", unit_id)?;
        self.repo
            .add_to_my_units(unit_id)
            .await
            .map_err(Error::network)?;
        info!(unit_id, "added to personal units");
        self.engine
            .run_sync_cycle(&SyncOptions::minimal().forced())
            .await
    }

    /// Leave the personal collection. The local copy goes with it; a unit
    /// that is still visible (e.g. global) returns as `minimal` on the
    /// following sync.
    #[instrument(skip(self))]
    pub async fn remove_from_my_units(&self, unit_id: &str) -> Result<SyncOutcome> {
        validate_id("unit", unit_id)?;
        self.repo
            .remove_from_my_units(unit_id)
            .await
            .map_err(Error::network)?;
        self.engine.delete_unit(unit_id).await?;
        info!(unit_id, "removed from personal units");
        self.engine
            .run_sync_cycle(&SyncOptions::minimal().forced())
            .await
    }

    #[instrument(skip(self))]
    pub async fn update_unit_sharing(&self, unit_id: &str, is_global: bool) -> Result<SyncOutcome> {
        validate_id("unit", unit_id)?;
        self.repo
            .update_sharing(unit_id, &SharingUpdate { is_global })
            .await
            .map_err(Error::network)?;
        info!(unit_id, is_global, "sharing updated");
        self.engine
            .run_sync_cycle(&SyncOptions::minimal().forced())
            .await
    }

    /// Queue a write for delivery and kick off a drain without waiting.
    pub async fn queue_mutation(&self, record: &NewOutboxRecord) -> Result<EnqueueOutcome> {
        let outcome = self.engine.outbox().enqueue(record).await?;
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            match engine.drain_outbox().await {
                Ok(report) if report.failure.is_some() => {
                    warn!(remaining = report.remaining, "outbox drain halted")
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "outbox drain failed"),
            }
        });
        Ok(outcome)
    }

    /// Pull when the cache is older than the staleness window; a fresh cache
    /// only gets its queued writes delivered. `Some` when a cycle ran.
    #[instrument(skip(self))]
    pub async fn refresh_if_stale(&self) -> Result<Option<SyncOutcome>> {
        if self.is_stale(Utc::now()).await? {
            return self
                .engine
                .run_sync_cycle(&SyncOptions::minimal())
                .await
                .map(Some);
        }
        let report = self.engine.drain_outbox().await?;
        if let Some(failure) = &report.failure {
            warn!(error = %failure.error, remaining = report.remaining, "outbox drain halted");
        }
        Ok(None)
    }

    pub async fn sync_now(&self, options: &SyncOptions) -> Result<SyncOutcome> {
        self.engine.run_sync_cycle(options).await
    }

    pub async fn sync_status(&self) -> Result<SyncStatus> {
        self.engine.status().await
    }
}

/// A downloaded unit is inconsistent when its summary lists lessons but none
/// are cached. A summary that cannot be read is treated as listing some.
fn needs_repair(detail: &UnitDetail) -> bool {
    if !detail.unit.is_downloaded() || !detail.lessons.is_empty() {
        return false;
    }
    match serde_json::from_str::<LessonOrder>(&detail.unit.unit_payload.body) {
        Ok(summary) => !summary.lesson_order.is_empty(),
        Err(_) => true,
    }
}

#[derive(Deserialize)]
struct LessonOrder {
    #[serde(default)]
    lesson_order: Vec<String>,
}
