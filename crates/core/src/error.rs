//! Unified error types for vault-sync.
//!
//! Cache tiers swallow most of these at their public boundary; they exist so
//! the durable stores and transport plumbing can propagate with `?`.

use tokio_rusqlite::rusqlite;

/// Unified error types for the vault-sync core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty page id).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// The durable store refused a write because it is full.
    #[error("QUOTA_EXCEEDED: {needed} bytes requested, quota is {quota} bytes")]
    QuotaExceeded { needed: usize, quota: usize },

    /// A payload does not fit under a hard size ceiling.
    #[error("SIZE_EXCEEDED: {what} is {bytes} bytes, limit is {limit} bytes")]
    SizeExceeded { what: String, bytes: usize, limit: usize },

    /// Value could not be encoded or decoded.
    #[error("SERIALIZATION_ERROR: {0}")]
    Serialization(String),

    /// Host transport is unavailable or rejected the operation.
    #[error("TRANSPORT_ERROR: {0}")]
    Transport(String),

    /// Content fetch collaborator failed.
    #[error("FETCH_FAILED: {0}")]
    FetchFailed(String),
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(ref e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
                Error::QuotaExceeded { needed: 0, quota: 0 }
            }
            other => Error::Database(tokio_rusqlite::Error::Error(other)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// True for storage-full conditions, which callers surface as a notification.
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::QuotaExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::SizeExceeded { what: "shared document".to_string(), bytes: 20_000, limit: 15_360 };
        assert!(err.to_string().contains("SIZE_EXCEEDED"));
        assert!(err.to_string().contains("20000"));
    }

    #[test]
    fn test_disk_full_maps_to_quota() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error { code: rusqlite::ErrorCode::DiskFull, extended_code: 13 },
            None,
        );
        let err: Error = sqlite_err.into();
        assert!(err.is_quota());
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: Error = parse.unwrap_err().into();
        assert!(err.to_string().starts_with("SERIALIZATION_ERROR"));
    }
}
