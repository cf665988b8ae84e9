//! Query parameters and view models used by repositories.
//!
//! Keep these structs focused on what queries take or return. Business logic
//! lives in the sync engine and content service.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which units a listing should include.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnitScope {
    #[default]
    All,
    Global,
    Personal,
}

/// Paginated unit listing, ordered by title then id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitListQuery {
    pub limit: i64,
    pub offset: i64,
    pub scope: UnitScope,
}

impl Default for UnitListQuery {
    fn default() -> Self {
        Self {
            limit: 10,
            offset: 0,
            scope: UnitScope::All,
        }
    }
}

/// The single persisted sync-state row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub cursor: Option<String>,
    pub last_pulled_at: Option<DateTime<Utc>>,
}
