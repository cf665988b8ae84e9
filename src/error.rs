//! Error taxonomy for the content cache.
//!
//! Storage-class failures are fatal to the current operation. Network
//! failures leave the cache untouched and are reported through the sync
//! status. Asset failures downgrade a unit to `failed` while keeping partial
//! progress. Validation failures are raised before any I/O happens.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("local file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("corrupt cache record: {0}")]
    Corrupt(String),
    #[error("network error: {0:#}")]
    Network(anyhow::Error),
    /// One asset that could not be stored. Unit downloads collect these in
    /// their report (`AssetDownloadReport::errors`) instead of failing.
    #[error("asset {asset_id} download failed: {reason}")]
    AssetDownload { asset_id: String, reason: String },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("unit {0} not found")]
    NotFound(String),
}

/// Coarse classification used by callers deciding on user-facing messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Storage,
    Network,
    AssetDownload,
    Validation,
    NotFound,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage(_)
            | Error::Migrate(_)
            | Error::Io(_)
            | Error::Codec(_)
            | Error::Corrupt(_) => ErrorKind::Storage,
            Error::Network(_) => ErrorKind::Network,
            Error::AssetDownload { .. } => ErrorKind::AssetDownload,
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
        }
    }

    pub fn network(err: impl Into<anyhow::Error>) -> Self {
        Error::Network(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reject empty or whitespace-only identifiers before touching storage.
pub fn validate_id(kind: &'static str, id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation(format!("{} id must be non-empty", kind)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_rejects_blank() {
        let err = validate_id("unit", "  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("unit id"));
        validate_id("unit", "u1").unwrap();
    }

    #[test]
    fn network_errors_keep_context() {
        let err = Error::network(anyhow::anyhow!("connection reset").context("pull failed"));
        assert_eq!(err.kind(), ErrorKind::Network);
        let msg = err.to_string();
        assert!(msg.contains("pull failed"));
        assert!(msg.contains("connection reset"));
    }
}
