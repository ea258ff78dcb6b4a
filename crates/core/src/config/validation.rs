//! Configuration validation rules.
//!
//! This module provides validation logic for `AppConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::{AppConfig, TRANSPORT_MESSAGE_LIMIT};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - any capacity or entry ceiling is 0
    /// - the shared safety margin leaves no room in the document
    /// - `images.prune_ratio` is outside (0, 1]
    /// - `protocol.message_limit_bytes` exceeds the 64KB transport ceiling
    /// - a protocol timeout is below 100ms
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_name.is_empty() {
            return Err(invalid("session_name", "must not be empty"));
        }
        if self.kv_quota_bytes == 0 {
            return Err(invalid("kv_quota_bytes", "must be greater than 0"));
        }
        if self.render.capacity == 0 {
            return Err(invalid("render.capacity", "must be greater than 0"));
        }

        if self.shared.max_entries == 0 {
            return Err(invalid("shared.max_entries", "must be greater than 0"));
        }
        if self.shared.evict_batch == 0 || self.shared.evict_batch > self.shared.max_entries {
            return Err(invalid("shared.evict_batch", "must be between 1 and shared.max_entries"));
        }
        if self.shared.safety_margin_bytes >= self.shared.doc_limit_bytes {
            return Err(invalid("shared.safety_margin_bytes", "must be smaller than shared.doc_limit_bytes"));
        }

        if self.images.max_entries == 0 || self.images.front_capacity == 0 {
            return Err(invalid("images", "entry ceilings must be greater than 0"));
        }
        if self.images.max_bytes == 0 {
            return Err(invalid("images.max_bytes", "must be greater than 0"));
        }
        if !(self.images.prune_ratio > 0.0 && self.images.prune_ratio <= 1.0) {
            return Err(invalid("images.prune_ratio", "must be within (0, 1]"));
        }

        if self.protocol.message_limit_bytes == 0 || self.protocol.message_limit_bytes > TRANSPORT_MESSAGE_LIMIT {
            return Err(invalid("protocol.message_limit_bytes", "must be between 1 and 65536"));
        }
        let timeouts = [
            ("protocol.content_timeout_ms", self.protocol.content_timeout_ms),
            ("protocol.refresh_timeout_ms", self.protocol.refresh_timeout_ms),
            ("protocol.tree_timeout_ms", self.protocol.tree_timeout_ms),
        ];
        for (field, value) in timeouts {
            if value < 100 {
                return Err(invalid(field, "must be at least 100ms"));
            }
        }

        if self.presence.heartbeat_secs == 0 {
            return Err(invalid("presence.heartbeat_secs", "must be greater than 0"));
        }
        if self.presence.stale_after_secs <= self.presence.heartbeat_secs {
            tracing::warn!(
                heartbeat_secs = self.presence.heartbeat_secs,
                stale_after_secs = self.presence.stale_after_secs,
                "owner records will look stale between heartbeats"
            );
        }

        Ok(())
    }
}
