//! Wire shapes exchanged with the content server.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::{AssetType, PayloadMode};

fn default_schema_version() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub cursor: Option<String>,
    pub payload: PayloadMode,
    pub force: bool,
    /// Restricts the pull to these units when non-empty.
    #[serde(default)]
    pub unit_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PullResponse {
    #[serde(default)]
    pub units: Vec<ServerUnitEntry>,
    #[serde(default)]
    pub deleted_unit_ids: Vec<String>,
    #[serde(default)]
    pub deleted_lesson_ids: Vec<String>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerUnitEntry {
    pub summary: ServerUnitSummary,
    #[serde(default)]
    pub lessons: Vec<ServerLesson>,
    #[serde(default)]
    pub assets: Vec<ServerAsset>,
}

/// Unit summary as the server shapes it. Fields the cache does not index
/// (ownership, podcast/art metadata, objectives) ride along in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerUnitSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub learner_level: Option<String>,
    #[serde(default)]
    pub is_global: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: i64,
    /// Authoritative lesson ordering by lesson id.
    #[serde(default)]
    pub lesson_order: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerLesson {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: i64,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerAsset {
    pub id: String,
    #[serde(rename = "type")]
    pub asset_type: AssetType,
    pub remote_uri: String,
    #[serde(default)]
    pub checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharingUpdate {
    pub is_global: bool,
}
