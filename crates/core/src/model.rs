//! Data model shared by every cache tier and the sync protocol.
//!
//! Page content is opaque here: blocks are carried as JSON values and never
//! interpreted.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Raw content blocks of a page, as returned by the fetch collaborator.
pub type Blocks = Vec<Value>;

/// Top-level shared document key holding the page content mirror.
pub const CONTENT_CACHE_KEY: &str = "contentCache";

/// Top-level shared document key holding the visible subset of the vault.
pub const VISIBLE_TREE_KEY: &str = "visibleTree";

/// Top-level shared document key holding the authoritative session record.
pub const OWNER_KEY: &str = "owner";

/// Generic unit stored in the local and shared caches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub key: String,
    pub payload: T,
    pub saved_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    pub fn new(key: impl Into<String>, payload: T) -> Self {
        Self { key: key.into(), payload, saved_at: Utc::now() }
    }
}

/// Lightweight page metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    #[serde(default)]
    pub icon: Option<Value>,
    #[serde(default)]
    pub cover: Option<Value>,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub last_edited_time: Option<DateTime<Utc>>,
}

/// Page metadata as persisted, stamped with the time it was cached.
///
/// Freshness is decided by the caller comparing `last_edited_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfoEntry {
    #[serde(flatten)]
    pub info: PageInfo,
    pub cached_at: DateTime<Utc>,
}

impl PageInfoEntry {
    /// True when the cached copy reflects `last_edited_time` or something newer.
    pub fn is_current(&self, last_edited_time: DateTime<Utc>) -> bool {
        self.info.last_edited_time.is_some_and(|cached| cached >= last_edited_time)
    }
}

/// Marks the authoritative host session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRecord {
    pub id: String,
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
}

impl OwnerRecord {
    /// Whether the last heartbeat is older than `threshold`.
    ///
    /// Nothing acts on this: authority is never reassigned on staleness.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_heartbeat) > threshold
    }
}

/// Message exchanged over a named broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEnvelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
    pub payload: T,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl<T> BroadcastEnvelope<T> {
    pub fn new(correlation_key: Option<String>, payload: T) -> Self {
        Self { correlation_key, payload, timestamp: Utc::now().timestamp_millis() }
    }
}

/// Typed view over the shared metadata document.
///
/// Parsing is lenient: malformed entries are skipped so one bad writer cannot
/// hide the rest of the mirror.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedDocument {
    pub content_cache: BTreeMap<String, CacheEntry<Value>>,
    pub visible_tree: Option<Value>,
    pub owner: Option<OwnerRecord>,
}

impl SharedDocument {
    pub fn from_metadata(metadata: &Map<String, Value>) -> Self {
        let content_cache = match metadata.get(CONTENT_CACHE_KEY) {
            Some(Value::Object(entries)) => entries
                .iter()
                .filter_map(|(key, raw)| match parse_value::<CacheEntry<Value>>(raw) {
                    Some(entry) => Some((key.clone(), entry)),
                    None => {
                        tracing::debug!(page_id = %key, "skipping malformed shared cache entry");
                        None
                    }
                })
                .collect(),
            _ => BTreeMap::new(),
        };

        Self {
            content_cache,
            visible_tree: metadata.get(VISIBLE_TREE_KEY).filter(|v| !v.is_null()).cloned(),
            owner: metadata.get(OWNER_KEY).and_then(parse_value),
        }
    }
}

fn parse_value<T: DeserializeOwned>(raw: &Value) -> Option<T> {
    T::deserialize(raw).ok()
}
