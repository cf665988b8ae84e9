//! Durable FIFO queue of local mutations awaiting delivery.
//!
//! Draining stops at the first failing record: later records are never sent
//! ahead of an earlier one, so a record that keeps failing holds back the
//! whole queue until it succeeds or is discarded.
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::model::{NewOutboxRecord, OutboxRecord};
use crate::remote::OutboxProcessor;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(i64),
    /// An unprocessed record with the same idempotency key already exists.
    Collapsed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainFailure {
    pub idempotency_key: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub processed: usize,
    pub remaining: i64,
    pub failure: Option<DrainFailure>,
}

#[derive(Debug)]
pub struct Outbox {
    pool: Pool,
    drain_lock: Mutex<()>,
}

impl Outbox {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            drain_lock: Mutex::new(()),
        }
    }

    #[instrument(skip_all, fields(key = %record.idempotency_key))]
    pub async fn enqueue(&self, record: &NewOutboxRecord) -> Result<EnqueueOutcome> {
        validate(record)?;
        match db::enqueue_outbox(&self.pool, record, Utc::now()).await? {
            Some(id) => {
                info!(id, endpoint = %record.endpoint, "queued outbox record");
                Ok(EnqueueOutcome::Queued(id))
            }
            None => {
                info!("outbox record already queued; collapsed");
                Ok(EnqueueOutcome::Collapsed)
            }
        }
    }

    /// Deliver queued records oldest-first until the queue is empty or a
    /// delivery fails. Concurrent drains run one after the other.
    #[instrument(skip_all)]
    pub async fn process(&self, processor: &dyn OutboxProcessor) -> Result<DrainReport> {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        while let Some(record) = db::next_outbox(&self.pool).await? {
            match processor.process(&record).await {
                Ok(()) => {
                    db::delete_outbox(&self.pool, record.id).await?;
                    report.processed += 1;
                    info!(id = record.id, key = %record.idempotency_key, "outbox record delivered");
                }
                Err(err) => {
                    let message = format!("{:#}", err);
                    warn!(
                        id = record.id,
                        key = %record.idempotency_key,
                        attempts = record.attempts + 1,
                        error = %message,
                        "outbox record failed; halting drain"
                    );
                    db::record_outbox_failure(&self.pool, record.id, &message).await?;
                    report.failure = Some(DrainFailure {
                        idempotency_key: record.idempotency_key,
                        error: message,
                    });
                    break;
                }
            }
        }

        report.remaining = db::count_outbox(&self.pool).await?;
        Ok(report)
    }

    /// Drop a queued record without delivering it.
    pub async fn discard(&self, idempotency_key: &str) -> Result<bool> {
        let removed = db::discard_outbox(&self.pool, idempotency_key).await?;
        if removed {
            warn!(key = idempotency_key, "outbox record discarded");
        }
        Ok(removed)
    }

    pub async fn list(&self) -> Result<Vec<OutboxRecord>> {
        db::list_outbox(&self.pool).await
    }

    pub async fn pending_count(&self) -> Result<i64> {
        db::count_outbox(&self.pool).await
    }
}

fn validate(record: &NewOutboxRecord) -> Result<()> {
    if record.idempotency_key.trim().is_empty() {
        return Err(Error::Validation("outbox idempotency key must be non-empty".into()));
    }
    if record.endpoint.trim().is_empty() {
        return Err(Error::Validation("outbox endpoint must be non-empty".into()));
    }
    if record.method.trim().is_empty() {
        return Err(Error::Validation("outbox method must be non-empty".into()));
    }
    Ok(())
}
