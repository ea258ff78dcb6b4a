//! Structured errors for the vault-host server.

use rmcp::model::{ErrorCode, ErrorData as McpError};
use vault_sync_core::Error;

/// Errors a tool call can end in.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Invalid input parameters (e.g., empty page id).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Nothing cached for the requested page.
    #[error("CACHE_MISS: {0}")]
    CacheMiss(String),

    #[error(transparent)]
    Core(#[from] Error),
}

impl From<HostError> for McpError {
    fn from(err: HostError) -> Self {
        let code = match &err {
            HostError::InvalidInput(_) | HostError::Core(Error::InvalidInput(_)) => -32602,
            HostError::CacheMiss(_) => -32001,
            HostError::Core(Error::Database(_) | Error::MigrationFailed(_)) => -32002,
            HostError::Core(Error::QuotaExceeded { .. } | Error::SizeExceeded { .. }) => -32007,
            HostError::Core(_) => -32000,
        };

        McpError { code: ErrorCode(code), message: err.to_string().into(), data: None }
    }
}
