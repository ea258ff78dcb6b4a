//! Per-client durable caches over a [`KvStore`].
//!
//! Reads never fail: an unparseable value is purged and reported as a miss.
//! Writes never fail either: a full store is surfaced once through
//! [`CacheEvents`] and the write is dropped.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::kv::KvStore;
use crate::events::CacheEvents;
use crate::model::{Blocks, CacheEntry, PageInfo, PageInfoEntry};

const BLOCKS_PREFIX: &str = "vault:blocks:";
const PAGE_INFO_PREFIX: &str = "vault:page-info:";

/// JSON values stored under a key prefix of a shared [`KvStore`].
#[derive(Clone)]
pub struct LocalCache<T> {
    store: Arc<dyn KvStore>,
    prefix: &'static str,
    tier: &'static str,
    events: CacheEvents,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> LocalCache<T> {
    pub fn new(store: Arc<dyn KvStore>, prefix: &'static str, tier: &'static str, events: CacheEvents) -> Self {
        Self { store, prefix, tier, events, _marker: PhantomData }
    }

    fn storage_key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        let key = self.storage_key(id);
        let raw = match self.store.get(&key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(tier = self.tier, key = %key, error = %e, "local cache read failed");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(tier = self.tier, key = %key, error = %e, "purging corrupt local cache entry");
                if let Err(e) = self.store.remove(&key).await {
                    tracing::warn!(tier = self.tier, key = %key, error = %e, "failed to purge corrupt entry");
                }
                None
            }
        }
    }

    /// Persist `value` under `id`. Returns whether the write landed.
    pub async fn set(&self, id: &str, value: &T) -> bool {
        let key = self.storage_key(id);
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(tier = self.tier, key = %key, error = %e, "local cache entry not serializable");
                return false;
            }
        };

        match self.store.set(&key, &raw).await {
            Ok(()) => true,
            Err(e) if e.is_quota() => {
                tracing::warn!(tier = self.tier, key = %key, bytes = raw.len(), "local cache quota exceeded");
                self.events.quota_exceeded(self.tier);
                false
            }
            Err(e) => {
                tracing::warn!(tier = self.tier, key = %key, error = %e, "local cache write failed");
                false
            }
        }
    }

    pub async fn remove(&self, id: &str) {
        let key = self.storage_key(id);
        if let Err(e) = self.store.remove(&key).await {
            tracing::warn!(tier = self.tier, key = %key, error = %e, "local cache remove failed");
        }
    }

    /// Remove every entry under this cache's prefix. Returns the count removed.
    pub async fn clear_all(&self) -> usize {
        let keys = match self.store.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(tier = self.tier, error = %e, "local cache key scan failed");
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys.iter().filter(|k| k.starts_with(self.prefix)) {
            match self.store.remove(key).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(tier = self.tier, key = %key, error = %e, "local cache remove failed"),
            }
        }
        tracing::debug!(tier = self.tier, removed, "cleared local cache");
        removed
    }
}

/// Raw content blocks per page.
#[derive(Clone)]
pub struct LocalBlockCache {
    inner: LocalCache<CacheEntry<Blocks>>,
}

impl LocalBlockCache {
    pub fn new(store: Arc<dyn KvStore>, events: CacheEvents) -> Self {
        Self { inner: LocalCache::new(store, BLOCKS_PREFIX, "blocks", events) }
    }

    pub async fn get(&self, page_id: &str) -> Option<Blocks> {
        self.get_entry(page_id).await.map(|entry| entry.payload)
    }

    pub async fn get_entry(&self, page_id: &str) -> Option<CacheEntry<Blocks>> {
        self.inner.get(page_id).await
    }

    pub async fn set(&self, page_id: &str, blocks: Blocks) -> bool {
        self.inner.set(page_id, &CacheEntry::new(page_id, blocks)).await
    }

    pub async fn remove(&self, page_id: &str) {
        self.inner.remove(page_id).await
    }

    pub async fn clear_all(&self) -> usize {
        self.inner.clear_all().await
    }
}

/// Icon, cover, properties and last-edited time per page.
#[derive(Clone)]
pub struct PageInfoCache {
    inner: LocalCache<PageInfoEntry>,
}

impl PageInfoCache {
    pub fn new(store: Arc<dyn KvStore>, events: CacheEvents) -> Self {
        Self { inner: LocalCache::new(store, PAGE_INFO_PREFIX, "page_info", events) }
    }

    pub async fn get(&self, page_id: &str) -> Option<PageInfoEntry> {
        self.inner.get(page_id).await
    }

    /// Store `info`, stamping it with the current time.
    pub async fn set(&self, page_id: &str, info: PageInfo) -> bool {
        self.inner.set(page_id, &PageInfoEntry { info, cached_at: Utc::now() }).await
    }

    pub async fn remove(&self, page_id: &str) {
        self.inner.remove(page_id).await
    }

    pub async fn clear_all(&self) -> usize {
        self.inner.clear_all().await
    }
}
