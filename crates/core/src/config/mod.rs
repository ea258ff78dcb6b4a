//! Application configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (VAULT_SYNC_*, nested sections split on `__`)
//! 2. TOML config file (if VAULT_SYNC_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Hard ceiling for a single broadcast payload imposed by the host transport.
pub const TRANSPORT_MESSAGE_LIMIT: usize = 64 * 1024;

/// Application configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (VAULT_SYNC_*)
/// 2. TOML config file (if VAULT_SYNC_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Path to the SQLite database backing the durable caches.
    ///
    /// Set via VAULT_SYNC_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Emulated quota of the durable key/value store in bytes.
    ///
    /// Set via VAULT_SYNC_KV_QUOTA_BYTES environment variable.
    #[serde(default = "default_kv_quota_bytes")]
    pub kv_quota_bytes: usize,

    /// Display name written into the owner record while hosting.
    #[serde(default = "default_session_name")]
    pub session_name: String,

    #[serde(default)]
    pub render: RenderConfig,

    #[serde(default)]
    pub shared: SharedConfig,

    #[serde(default)]
    pub images: ImageConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub presence: PresenceConfig,
}

/// In-memory rendered page cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "default_render_capacity")]
    pub capacity: usize,
}

/// Shared room document limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Effective size limit of the shared document.
    #[serde(default = "default_doc_limit_bytes")]
    pub doc_limit_bytes: usize,

    /// Headroom kept below `doc_limit_bytes` for other writers.
    #[serde(default = "default_safety_margin_bytes")]
    pub safety_margin_bytes: usize,

    #[serde(default = "default_shared_max_entries")]
    pub max_entries: usize,

    /// Minimum entries dropped at once when a new key arrives at `max_entries`.
    #[serde(default = "default_evict_batch")]
    pub evict_batch: usize,
}

/// Image cache limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_image_max_bytes")]
    pub max_bytes: u64,

    /// Fraction of `max_bytes` the maintenance pass prunes down to.
    #[serde(default = "default_prune_ratio")]
    pub prune_ratio: f64,

    #[serde(default = "default_front_capacity")]
    pub front_capacity: usize,

    #[serde(default = "default_image_ttl_secs")]
    pub ttl_secs: u64,
}

/// Broadcast request/response settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_message_limit_bytes")]
    pub message_limit_bytes: usize,

    #[serde(default = "default_content_timeout_ms")]
    pub content_timeout_ms: u64,

    /// Timeout for content requests carrying the force-refresh flag.
    #[serde(default = "default_refresh_timeout_ms")]
    pub refresh_timeout_ms: u64,

    #[serde(default = "default_tree_timeout_ms")]
    pub tree_timeout_ms: u64,
}

/// Owner record heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Age after which an owner record counts as stale. Informational only.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./vault-sync-cache.sqlite")
}

fn default_kv_quota_bytes() -> usize {
    5_242_880 // 5MB
}

fn default_session_name() -> String {
    "vault-host".into()
}

fn default_render_capacity() -> usize {
    20
}

fn default_doc_limit_bytes() -> usize {
    16 * 1024
}

fn default_safety_margin_bytes() -> usize {
    1024
}

fn default_shared_max_entries() -> usize {
    10
}

fn default_evict_batch() -> usize {
    3
}

fn default_image_max_entries() -> usize {
    200
}

fn default_image_max_bytes() -> u64 {
    50 * 1024 * 1024
}

fn default_prune_ratio() -> f64 {
    0.8
}

fn default_front_capacity() -> usize {
    30
}

fn default_image_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_message_limit_bytes() -> usize {
    TRANSPORT_MESSAGE_LIMIT
}

fn default_content_timeout_ms() -> u64 {
    5_000
}

fn default_refresh_timeout_ms() -> u64 {
    10_000
}

fn default_tree_timeout_ms() -> u64 {
    5_000
}

fn default_heartbeat_secs() -> u64 {
    120
}

fn default_stale_after_secs() -> u64 {
    900
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            kv_quota_bytes: default_kv_quota_bytes(),
            session_name: default_session_name(),
            render: RenderConfig::default(),
            shared: SharedConfig::default(),
            images: ImageConfig::default(),
            protocol: ProtocolConfig::default(),
            presence: PresenceConfig::default(),
        }
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { capacity: default_render_capacity() }
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            doc_limit_bytes: default_doc_limit_bytes(),
            safety_margin_bytes: default_safety_margin_bytes(),
            max_entries: default_shared_max_entries(),
            evict_batch: default_evict_batch(),
        }
    }
}

impl SharedConfig {
    /// Largest serialized document size a writer may commit.
    pub fn safe_limit(&self) -> usize {
        self.doc_limit_bytes.saturating_sub(self.safety_margin_bytes)
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            max_entries: default_image_max_entries(),
            max_bytes: default_image_max_bytes(),
            prune_ratio: default_prune_ratio(),
            front_capacity: default_front_capacity(),
            ttl_secs: default_image_ttl_secs(),
        }
    }
}

impl ImageConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Byte total the maintenance pass prunes down to once `max_bytes` is exceeded.
    pub fn prune_target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.prune_ratio) as u64
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            message_limit_bytes: default_message_limit_bytes(),
            content_timeout_ms: default_content_timeout_ms(),
            refresh_timeout_ms: default_refresh_timeout_ms(),
            tree_timeout_ms: default_tree_timeout_ms(),
        }
    }
}

impl ProtocolConfig {
    /// Response deadline for a content request.
    pub fn content_timeout(&self, force_refresh: bool) -> Duration {
        if force_refresh {
            Duration::from_millis(self.refresh_timeout_ms)
        } else {
            Duration::from_millis(self.content_timeout_ms)
        }
    }

    pub fn tree_timeout(&self) -> Duration {
        Duration::from_millis(self.tree_timeout_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self { heartbeat_secs: default_heartbeat_secs(), stale_after_secs: default_stale_after_secs() }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `VAULT_SYNC_`
    /// 2. TOML file from `VAULT_SYNC_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("VAULT_SYNC_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("VAULT_SYNC_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
