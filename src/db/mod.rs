//! Persistent store: the local SQLite cache of units, lessons, assets, the
//! outbox and the sync cursor.
//!
//! - `model`: query parameters and row-level view models.
//! - `repo`: SQL-only functions mapping rows into domain records.
//!
//! Callers import from `content_sync::db`; the repository API is re-exported.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{SyncState, UnitListQuery, UnitScope};
