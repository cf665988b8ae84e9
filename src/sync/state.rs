//! Per-unit cache-mode state machine.
//!
//! Cache mode (`minimal`/`full`) and download status
//! (`idle`/`pending`/`completed`/`failed`) are separate axes: a unit can be
//! fully synced in metadata while its assets are still downloading.
//!
//! ```text
//! absent -> minimal --request--> full(pending) --assets ok--> full(completed)
//!                                      \--asset failed--> full(failed)
//! full(*) --remove--> minimal          any --delete/tombstone--> absent
//! ```
use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::{Error, Result};
use crate::model::{CacheMode, CachedUnit, DownloadStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTransition {
    /// User asked to keep the unit offline.
    RequestDownload,
    /// Every asset of the unit is stored locally.
    AssetsCompleted,
    /// At least one asset, or the content pull feeding it, failed.
    DownloadFailed,
    /// User removed the offline copy.
    RemoveDownload,
}

impl fmt::Display for CacheTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheTransition::RequestDownload => "request download",
            CacheTransition::AssetsCompleted => "complete download",
            CacheTransition::DownloadFailed => "fail download",
            CacheTransition::RemoveDownload => "remove download",
        };
        f.write_str(name)
    }
}

/// Apply a transition to a unit, returning the new record.
pub fn transition(
    unit: &CachedUnit,
    event: CacheTransition,
    now: DateTime<Utc>,
) -> Result<CachedUnit> {
    use CacheMode::*;
    use DownloadStatus::*;

    let mut next = unit.clone();
    match (event, unit.cache_mode, unit.download_status) {
        (CacheTransition::RequestDownload, _, Pending) => {}
        (CacheTransition::RequestDownload, _, _) => {
            next.cache_mode = Full;
            next.download_status = Pending;
        }
        (CacheTransition::AssetsCompleted, Full, _) => {
            next.download_status = Completed;
            next.downloaded_at = Some(now);
        }
        (CacheTransition::DownloadFailed, Full, _) => {
            next.download_status = Failed;
        }
        (CacheTransition::RemoveDownload, _, _) => {
            next.cache_mode = Minimal;
            next.download_status = Idle;
            next.downloaded_at = None;
        }
        (event, mode, status) => {
            return Err(Error::Validation(format!(
                "cannot {} for unit {} in {}/{}",
                event,
                unit.id,
                mode.as_str(),
                status.as_str()
            )));
        }
    }
    Ok(next)
}
