use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use crate::error::{Error, Result};

/// Whether a unit is kept as metadata only or with lessons and assets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CacheMode {
    Minimal,
    Full,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Minimal => "minimal",
            CacheMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minimal" => Some(CacheMode::Minimal),
            "full" => Some(CacheMode::Full),
            _ => None,
        }
    }
}

/// Download lifecycle shared by units and individual assets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Idle,
    Pending,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Idle => "idle",
            DownloadStatus::Pending => "pending",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(DownloadStatus::Idle),
            "pending" => Some(DownloadStatus::Pending),
            "completed" => Some(DownloadStatus::Completed),
            "failed" => Some(DownloadStatus::Failed),
            _ => None,
        }
    }
}

pub type AssetStatus = DownloadStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AssetType {
    Audio,
    Image,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Audio => "audio",
            AssetType::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(AssetType::Audio),
            "image" => Some(AssetType::Image),
            _ => None,
        }
    }
}

/// How much of a unit a pull asks the server for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    Minimal,
    Full,
}

impl PayloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadMode::Minimal => "minimal",
            PayloadMode::Full => "full",
        }
    }
}

impl From<PayloadMode> for CacheMode {
    fn from(mode: PayloadMode) -> Self {
        match mode {
            PayloadMode::Minimal => CacheMode::Minimal,
            PayloadMode::Full => CacheMode::Full,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncResult {
    #[default]
    Idle,
    Success,
    Error,
}

/// Server-shaped JSON kept verbatim, tagged with the schema version it was
/// written under. Decoding is explicit so unknown fields are never lost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpaqueBlob {
    pub schema_version: i64,
    pub body: String,
}

impl OpaqueBlob {
    pub fn new(schema_version: i64, body: impl Into<String>) -> Self {
        Self {
            schema_version,
            body: body.into(),
        }
    }

    pub fn from_json<T: Serialize>(schema_version: i64, value: &T) -> Result<Self> {
        Ok(Self::new(schema_version, serde_json::to_string(value)?))
    }

    /// Decode the body, refusing schema versions the caller does not understand.
    pub fn decode<T: DeserializeOwned>(&self, supported: RangeInclusive<i64>) -> Result<T> {
        if !supported.contains(&self.schema_version) {
            return Err(Error::Validation(format!(
                "unsupported payload schema version {} (supported {}..={})",
                self.schema_version,
                supported.start(),
                supported.end()
            )));
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedUnit {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub learner_level: Option<String>,
    pub is_global: bool,
    pub updated_at: DateTime<Utc>,
    pub schema_version: i64,
    pub cache_mode: CacheMode,
    pub download_status: DownloadStatus,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
    pub unit_payload: OpaqueBlob,
}

impl CachedUnit {
    pub fn is_downloaded(&self) -> bool {
        self.cache_mode == CacheMode::Full && self.download_status == DownloadStatus::Completed
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedLesson {
    pub id: String,
    pub unit_id: String,
    pub title: String,
    pub position: i64,
    pub payload: OpaqueBlob,
    pub updated_at: DateTime<Utc>,
    pub schema_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedAsset {
    pub id: String,
    pub unit_id: String,
    pub asset_type: AssetType,
    pub remote_uri: String,
    pub checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub status: AssetStatus,
    pub local_path: Option<String>,
    pub downloaded_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// A unit joined with its lessons (ordered by position) and assets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnitDetail {
    pub unit: CachedUnit,
    pub lessons: Vec<CachedLesson>,
    pub assets: Vec<CachedAsset>,
}

/// Mutation to be queued; `idempotency_key` identifies the logical change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewOutboxRecord {
    pub endpoint: String,
    pub method: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub idempotency_key: String,
}

impl NewOutboxRecord {
    pub fn new(
        method: impl Into<String>,
        endpoint: impl Into<String>,
        payload: serde_json::Value,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            payload,
            headers: BTreeMap::new(),
            idempotency_key: idempotency_key.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboxRecord {
    pub id: i64,
    pub endpoint: String,
    pub method: String,
    pub payload: serde_json::Value,
    pub headers: BTreeMap<String, String>,
    pub idempotency_key: String,
    pub enqueued_at: DateTime<Utc>,
    pub attempts: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CacheModeCounts {
    pub minimal: i64,
    pub full: i64,
}

/// Process-wide snapshot of the sync machinery. Not a persisted entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SyncStatus {
    pub last_pulled_at: Option<DateTime<Utc>>,
    pub last_cursor: Option<String>,
    pub pending_writes: i64,
    pub cache_mode_counts: CacheModeCounts,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub last_sync_result: SyncResult,
    pub last_sync_error: Option<String>,
}
