//! Pure merge of server payloads into cache records.
//!
//! The server owns content (titles, descriptions, lessons, ownership); the
//! device owns local intent (cache mode, download status, downloaded-at).
//! Nothing here touches storage.
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::Result;
use crate::model::{
    AssetStatus, CacheMode, CachedAsset, CachedLesson, CachedUnit, DownloadStatus, OpaqueBlob,
    PayloadMode,
};
use crate::remote::model::{ServerAsset, ServerLesson, ServerUnitEntry};

/// What a single pull entry turns into. `None` collections mean "leave what
/// is cached alone".
#[derive(Debug, Clone, PartialEq)]
pub struct MergedEntry {
    pub unit: CachedUnit,
    pub lessons: Option<Vec<CachedLesson>>,
    pub assets: Option<Vec<CachedAsset>>,
}

/// Merge one server unit summary with the cached record, if any.
///
/// An existing unit keeps its cache mode, download status and downloaded-at.
/// A new unit is `full` when the response carried lessons, otherwise it takes
/// the requested payload mode.
pub fn merge_unit(
    existing: Option<&CachedUnit>,
    incoming: &ServerUnitEntry,
    requested: PayloadMode,
    now: DateTime<Utc>,
) -> Result<CachedUnit> {
    let summary = &incoming.summary;
    let (cache_mode, download_status, downloaded_at) = match existing {
        Some(local) => (local.cache_mode, local.download_status, local.downloaded_at),
        None if !incoming.lessons.is_empty() => (CacheMode::Full, DownloadStatus::Idle, None),
        None => (CacheMode::from(requested), DownloadStatus::Idle, None),
    };

    Ok(CachedUnit {
        id: summary.id.clone(),
        title: summary.title.clone(),
        description: summary.description.clone(),
        learner_level: summary.learner_level.clone(),
        is_global: summary.is_global,
        updated_at: summary.updated_at,
        schema_version: summary.schema_version,
        cache_mode,
        download_status,
        downloaded_at,
        synced_at: now,
        unit_payload: OpaqueBlob::from_json(summary.schema_version, summary)?,
    })
}

/// Position of each lesson: its index in the authoritative order, then any
/// lessons the order does not mention, in response order.
pub fn lesson_positions(order: &[String], lessons: &[ServerLesson]) -> Vec<i64> {
    let ranked: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    let mut trailing = order.len();
    lessons
        .iter()
        .map(|lesson| match ranked.get(lesson.id.as_str()) {
            Some(&i) => i as i64,
            None => {
                let pos = trailing;
                trailing += 1;
                pos as i64
            }
        })
        .collect()
}

pub fn build_lessons(
    unit_id: &str,
    order: &[String],
    lessons: &[ServerLesson],
) -> Result<Vec<CachedLesson>> {
    let positions = lesson_positions(order, lessons);
    lessons
        .iter()
        .zip(positions)
        .map(|(lesson, position)| {
            Ok(CachedLesson {
                id: lesson.id.clone(),
                unit_id: unit_id.to_string(),
                title: lesson.title.clone(),
                position,
                payload: OpaqueBlob::from_json(lesson.schema_version, &lesson.payload)?,
                updated_at: lesson.updated_at,
                schema_version: lesson.schema_version,
            })
        })
        .collect()
}

/// An asset whose remote URI and checksum did not change keeps its local
/// copy; anything else starts over as `idle`.
pub fn merge_assets(
    unit_id: &str,
    existing: &[CachedAsset],
    incoming: &[ServerAsset],
) -> Vec<CachedAsset> {
    let by_id: HashMap<&str, &CachedAsset> =
        existing.iter().map(|a| (a.id.as_str(), a)).collect();
    incoming
        .iter()
        .map(|remote| {
            let mut asset = CachedAsset {
                id: remote.id.clone(),
                unit_id: unit_id.to_string(),
                asset_type: remote.asset_type,
                remote_uri: remote.remote_uri.clone(),
                checksum: remote.checksum.clone(),
                updated_at: remote.updated_at,
                status: AssetStatus::Idle,
                local_path: None,
                downloaded_at: None,
                last_error: None,
            };
            if let Some(local) = by_id.get(remote.id.as_str()) {
                if local.remote_uri == remote.remote_uri && local.checksum == remote.checksum {
                    asset.status = local.status;
                    asset.local_path = local.local_path.clone();
                    asset.downloaded_at = local.downloaded_at;
                    asset.last_error = local.last_error.clone();
                }
            }
            asset
        })
        .collect()
}

/// Merge a whole pull entry. Lessons are only written for units cached in
/// full mode, and only when the response carried any, so a minimal unit never
/// has lessons and a metadata-only refresh never wipes a download.
pub fn merge_entry(
    existing: Option<&CachedUnit>,
    existing_assets: &[CachedAsset],
    incoming: &ServerUnitEntry,
    requested: PayloadMode,
    now: DateTime<Utc>,
) -> Result<MergedEntry> {
    let unit = merge_unit(existing, incoming, requested, now)?;

    let lessons = if unit.cache_mode == CacheMode::Full && !incoming.lessons.is_empty() {
        Some(build_lessons(
            &unit.id,
            &incoming.summary.lesson_order,
            &incoming.lessons,
        )?)
    } else {
        None
    };

    let assets = if !incoming.assets.is_empty() || requested == PayloadMode::Full {
        Some(merge_assets(&unit.id, existing_assets, &incoming.assets))
    } else {
        None
    };

    Ok(MergedEntry {
        unit,
        lessons,
        assets,
    })
}
