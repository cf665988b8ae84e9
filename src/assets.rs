//! Materializes a unit's audio/image assets on local storage.
//!
//! Each asset is downloaded at most once at a time (a per-asset lock plus a
//! status recheck), different assets download concurrently up to a fixed
//! number of slots, and a failing asset never rolls back its completed
//! siblings.
//!
//! Bytes are only written to disk and recorded while the owning unit is
//! still `full`. Demotion and deletion take the unit's gate exclusively, so
//! a download that lands after the unit was demoted is discarded.
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, Semaphore};
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::{validate_id, Error, Result};
use crate::model::{AssetStatus, AssetType, CacheMode, CachedAsset, DownloadStatus};
use crate::sync::state::{transition, CacheTransition};

/// Fetches the bytes behind an asset's remote URI.
#[async_trait]
pub trait AssetDownloader: Send + Sync {
    async fn fetch(&self, asset: &CachedAsset) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct HttpAssetDownloader {
    http: Client,
}

impl HttpAssetDownloader {
    pub fn new() -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("content-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AssetDownloader for HttpAssetDownloader {
    async fn fetch(&self, asset: &CachedAsset) -> anyhow::Result<Vec<u8>> {
        let res = self
            .http
            .get(&asset.remote_uri)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", asset.remote_uri))?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!("asset server returned {} for {}", status, asset.remote_uri));
        }
        let bytes = res.bytes().await.context("failed to read asset body")?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetOutcome {
    Completed,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetFailure {
    pub asset_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetDownloadReport {
    pub unit_id: String,
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<AssetFailure>,
    pub unit_status: DownloadStatus,
}

/// Per-asset failures are reported here rather than as an `Err` from
/// [`AssetFetcher::download_unit_assets`]; one asset failing never aborts
/// its siblings.
impl AssetDownloadReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Failed assets as [`Error::AssetDownload`] values.
    pub fn errors(&self) -> Vec<Error> {
        self.failed
            .iter()
            .map(|f| Error::AssetDownload {
                asset_id: f.asset_id.clone(),
                reason: f.error.clone(),
            })
            .collect()
    }
}

pub struct AssetFetcher {
    pool: Pool,
    downloader: Arc<dyn AssetDownloader>,
    media_dir: PathBuf,
    slots: Semaphore,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    unit_gates: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl AssetFetcher {
    pub fn new(
        pool: Pool,
        downloader: Arc<dyn AssetDownloader>,
        media_dir: impl Into<PathBuf>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            pool,
            downloader,
            media_dir: media_dir.into(),
            slots: Semaphore::new(max_concurrent.max(1)),
            in_flight: Mutex::new(HashMap::new()),
            unit_gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    /// Download every not-yet-completed asset of a unit and settle the unit's
    /// download status: `completed` if all assets are local, else `failed`.
    #[instrument(skip(self))]
    pub async fn download_unit_assets(&self, unit_id: &str) -> Result<AssetDownloadReport> {
        validate_id("unit", unit_id)?;
        if db::get_unit(&self.pool, unit_id).await?.is_none() {
            return Err(Error::NotFound(unit_id.to_string()));
        }

        let assets = db::list_assets(&self.pool, unit_id).await?;
        let outcomes = join_all(assets.iter().map(|a| self.download_asset(&a.id))).await;

        let mut report = AssetDownloadReport {
            unit_id: unit_id.to_string(),
            completed: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            unit_status: DownloadStatus::Completed,
        };
        for (asset, outcome) in assets.iter().zip(outcomes) {
            match outcome? {
                AssetOutcome::Completed => report.completed.push(asset.id.clone()),
                AssetOutcome::Skipped => report.skipped.push(asset.id.clone()),
                AssetOutcome::Failed(error) => report.failed.push(AssetFailure {
                    asset_id: asset.id.clone(),
                    error,
                }),
            }
        }
        if !report.failed.is_empty() {
            report.unit_status = DownloadStatus::Failed;
        }

        // A unit demoted or deleted while its assets were in flight keeps
        // whatever state the demotion gave it.
        let gate = self.unit_gate(unit_id).await;
        let _shared = gate.read().await;
        match db::get_unit(&self.pool, unit_id).await? {
            Some(unit) if unit.cache_mode == CacheMode::Full => {
                let event = if report.is_success() {
                    CacheTransition::AssetsCompleted
                } else {
                    CacheTransition::DownloadFailed
                };
                let next = transition(&unit, event, Utc::now())?;
                db::set_unit_download_state(
                    &self.pool,
                    unit_id,
                    next.cache_mode,
                    next.download_status,
                    next.downloaded_at,
                )
                .await?;
            }
            _ => debug!(unit_id, "unit no longer full; leaving status untouched"),
        }

        if report.is_success() {
            info!(
                unit_id,
                completed = report.completed.len(),
                skipped = report.skipped.len(),
                "unit assets downloaded"
            );
        } else {
            warn!(
                unit_id,
                completed = report.completed.len(),
                failed = report.failed.len(),
                "unit asset download incomplete"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    pub async fn download_asset(&self, asset_id: &str) -> Result<AssetOutcome> {
        let lock = self.asset_lock(asset_id).await;
        let outcome = {
            let _held = lock.lock().await;
            self.download_locked(asset_id).await
        };
        drop(lock);
        self.release_asset_lock(asset_id).await;
        outcome
    }

    async fn download_locked(&self, asset_id: &str) -> Result<AssetOutcome> {
        let Some(asset) = db::get_asset(&self.pool, asset_id).await? else {
            return Ok(AssetOutcome::Skipped);
        };
        if asset.status == AssetStatus::Completed && local_copy_exists(&asset).await {
            return Ok(AssetOutcome::Skipped);
        }

        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| Error::AssetDownload {
                asset_id: asset_id.to_string(),
                reason: "download slots closed".into(),
            })?;

        let gate = self.unit_gate(&asset.unit_id).await;
        {
            let _shared = gate.read().await;
            if !self.unit_is_full(&asset.unit_id).await? {
                debug!(asset_id, "unit is not full; not fetching");
                return Ok(AssetOutcome::Skipped);
            }
            db::mark_asset_pending(&self.pool, asset_id).await?;
        }

        let fetched = self.fetch_verified(&asset).await;

        let _shared = gate.read().await;
        if !self.unit_is_full(&asset.unit_id).await? {
            debug!(asset_id, "unit demoted or deleted mid-download; discarding");
            return Ok(AssetOutcome::Skipped);
        }
        let stored = match fetched {
            Ok(bytes) => self.store(&asset, &bytes).await,
            Err(err) => Err(err),
        };
        match stored {
            Ok(path) => {
                let path = path.to_string_lossy().to_string();
                db::mark_asset_completed(&self.pool, asset_id, &path, Utc::now()).await?;
                debug!(asset_id, path = %path, "asset stored");
                Ok(AssetOutcome::Completed)
            }
            Err(err) => {
                let reason = format!("{:#}", err);
                warn!(asset_id, error = %reason, "asset download failed");
                db::mark_asset_failed(&self.pool, asset_id, &reason).await?;
                Ok(AssetOutcome::Failed(reason))
            }
        }
    }

    async fn unit_is_full(&self, unit_id: &str) -> Result<bool> {
        Ok(matches!(
            db::get_unit(&self.pool, unit_id).await?,
            Some(unit) if unit.cache_mode == CacheMode::Full
        ))
    }

    async fn fetch_verified(&self, asset: &CachedAsset) -> anyhow::Result<Vec<u8>> {
        let bytes = self.downloader.fetch(asset).await?;
        if let Some(expected) = asset.checksum.as_deref().filter(|c| !c.is_empty()) {
            let actual = sha256_hex(&bytes);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(anyhow!(
                    "checksum mismatch: expected {}, got {}",
                    expected,
                    actual
                ));
            }
        }
        Ok(bytes)
    }

    async fn store(&self, asset: &CachedAsset, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        let dest = self.asset_path(asset);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let part = dest.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&part, bytes)
            .await
            .with_context(|| format!("failed to write {}", part.display()))?;
        if let Err(err) = tokio::fs::rename(&part, &dest).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(anyhow!(err).context(format!("failed to move asset to {}", dest.display())));
        }
        Ok(dest)
    }

    /// `<media_dir>/<unit key>/<asset key>.<ext>`; see [`file_key`].
    pub fn asset_path(&self, asset: &CachedAsset) -> PathBuf {
        self.unit_dir(&asset.unit_id)
            .join(format!("{}.{}", file_key(&asset.id), extension_for(asset)))
    }

    pub fn unit_dir(&self, unit_id: &str) -> PathBuf {
        self.media_dir.join(file_key(unit_id))
    }

    /// Block asset completions for a unit until the guard is dropped. Held
    /// while a unit is demoted or deleted so no file lands after cleanup.
    pub async fn lock_unit(&self, unit_id: &str) -> OwnedRwLockWriteGuard<()> {
        self.unit_gate(unit_id).await.write_owned().await
    }

    async fn unit_gate(&self, unit_id: &str) -> Arc<RwLock<()>> {
        let mut gates = self.unit_gates.lock().await;
        gates
            .entry(unit_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Delete every downloaded file of a unit.
    #[instrument(skip(self))]
    pub async fn remove_unit_files(&self, unit_id: &str) -> Result<()> {
        let dir = self.unit_dir(unit_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                debug!(unit_id, dir = %dir.display(), "removed unit media");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn asset_lock(&self, asset_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.in_flight.lock().await;
        map.entry(asset_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn release_asset_lock(&self, asset_id: &str) {
        let mut map = self.in_flight.lock().await;
        if let Some(lock) = map.get(asset_id) {
            if Arc::strong_count(lock) == 1 {
                map.remove(asset_id);
            }
        }
    }
}

async fn local_copy_exists(asset: &CachedAsset) -> bool {
    match asset.local_path.as_deref() {
        Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
        None => false,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Filesystem-safe name for an id: the sanitized id plus a short digest of
/// the raw id, so ids that sanitize alike still get distinct files.
fn file_key(id: &str) -> String {
    let digest = sha256_hex(id.as_bytes());
    format!("{}-{}", sanitize(id), &digest[..12])
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn extension_for(asset: &CachedAsset) -> String {
    let path = asset
        .remote_uri
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    let from_uri = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()));
    match from_uri {
        Some(ext) => ext.to_ascii_lowercase(),
        None => match asset.asset_type {
            AssetType::Audio => "mp3".into(),
            AssetType::Image => "jpg".into(),
        },
    }
}
