//! Host-owned mirror of recently viewed pages inside the shared document.
//!
//! The shared document is small and visible to every client. Writers keep
//! its serialized size under `doc_limit - safety_margin` and its page count
//! under `max_entries`, evicting oldest-by-`savedAt` entries. A write that
//! cannot be made to fit is abandoned and the document is left untouched;
//! viewers then rely on the on-demand request path instead.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::Error;
use crate::config::SharedConfig;
use crate::events::{CacheEvent, CacheEvents};
use crate::model::{CONTENT_CACHE_KEY, CacheEntry, SharedDocument, VISIBLE_TREE_KEY};
use crate::size::{self, SizeCheck};
use crate::transport::{HostTransport, RoleOracle};

/// Result of a privileged shared document write.
#[derive(Debug, Clone, PartialEq)]
pub enum SharedWrite {
    /// Written. `evicted` lists the page ids dropped to make room.
    Committed { evicted: Vec<String>, bytes: usize },

    /// Could not fit even after evicting everything; nothing was written.
    Abandoned { bytes: usize },

    /// This session is not authoritative.
    NotAuthoritative,

    /// The transport failed; nothing was written.
    Unavailable,
}

impl SharedWrite {
    pub fn is_committed(&self) -> bool {
        matches!(self, SharedWrite::Committed { .. })
    }
}

/// Shared room content mirror.
#[derive(Clone)]
pub struct SharedRoomCache {
    transport: Arc<dyn HostTransport>,
    role: Arc<dyn RoleOracle>,
    config: SharedConfig,
    events: CacheEvents,
}

type ContentMap = BTreeMap<String, CacheEntry<Value>>;

impl SharedRoomCache {
    pub fn new(
        transport: Arc<dyn HostTransport>, role: Arc<dyn RoleOracle>, config: SharedConfig, events: CacheEvents,
    ) -> Self {
        Self { transport, role, config, events }
    }

    /// Passive read of the locally mirrored document.
    pub async fn get(&self, page_id: &str) -> Option<Value> {
        self.document().await?.content_cache.remove(page_id).map(|entry| entry.payload)
    }

    /// Visible subset of the vault as last written by the host.
    pub async fn visible_tree(&self) -> Option<Value> {
        self.document().await?.visible_tree
    }

    /// Page ids currently mirrored.
    pub async fn keys(&self) -> Vec<String> {
        self.document()
            .await
            .map(|doc| doc.content_cache.into_keys().collect())
            .unwrap_or_default()
    }

    async fn document(&self) -> Option<SharedDocument> {
        match self.transport.get_metadata().await {
            Ok(metadata) => Some(SharedDocument::from_metadata(&metadata)),
            Err(e) => {
                tracing::debug!(error = %e, "shared document unavailable");
                None
            }
        }
    }

    /// Mirror `payload` for `page_id`, evicting older entries as needed.
    pub async fn insert(&self, page_id: &str, payload: Value) -> SharedWrite {
        self.insert_entry(CacheEntry::new(page_id, payload)).await
    }

    /// Mirror a pre-stamped entry. Ordering uses `entry.saved_at`.
    pub async fn insert_entry(&self, entry: CacheEntry<Value>) -> SharedWrite {
        if !self.role.is_authoritative().await {
            tracing::debug!(page_id = %entry.key, "skipping shared cache write, not authoritative");
            return SharedWrite::NotAuthoritative;
        }

        let metadata = match self.transport.get_metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(page_id = %entry.key, error = %e, "shared document unavailable");
                return SharedWrite::Unavailable;
            }
        };
        let mut entries = SharedDocument::from_metadata(&metadata).content_cache;
        let page_id = entry.key.clone();
        let mut evicted = Vec::new();

        if !entries.contains_key(&page_id) && entries.len() >= self.config.max_entries {
            // Another writer may have left the document over the cap.
            let excess = (entries.len() + 1).saturating_sub(self.config.max_entries);
            for key in oldest_keys(&entries, excess.max(self.config.evict_batch), &page_id) {
                entries.remove(&key);
                evicted.push(key);
            }
        }
        entries.insert(page_id.clone(), entry);

        loop {
            let check = match self.measure(&metadata, &entries) {
                Ok(check) => check,
                Err(e) => {
                    tracing::warn!(page_id = %page_id, error = %e, "shared cache entry not serializable");
                    return SharedWrite::Unavailable;
                }
            };
            if check.fits() {
                return self.commit(&page_id, entries, evicted, check.bytes).await;
            }

            match oldest_keys(&entries, 1, &page_id).pop() {
                Some(oldest) => {
                    entries.remove(&oldest);
                    evicted.push(oldest);
                }
                None => {
                    tracing::warn!(
                        page_id = %page_id,
                        bytes = check.bytes,
                        limit = check.limit,
                        "abandoning shared cache write, entry alone exceeds the document limit"
                    );
                    self.events.emit(CacheEvent::SharedWriteAbandoned { page_id, bytes: check.bytes });
                    return SharedWrite::Abandoned { bytes: check.bytes };
                }
            }
        }
    }

    /// Serialized size of the whole document with `entries` as its content map.
    fn measure(&self, metadata: &Map<String, Value>, entries: &ContentMap) -> Result<SizeCheck, Error> {
        let mut candidate = metadata.clone();
        candidate.insert(CONTENT_CACHE_KEY.to_string(), serde_json::to_value(entries)?);
        size::check(&candidate, self.config.safe_limit())
    }

    async fn commit(&self, page_id: &str, entries: ContentMap, evicted: Vec<String>, bytes: usize) -> SharedWrite {
        let content = match serde_json::to_value(&entries) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(page_id = %page_id, error = %e, "shared cache entry not serializable");
                return SharedWrite::Unavailable;
            }
        };
        let mut patch = Map::new();
        patch.insert(CONTENT_CACHE_KEY.to_string(), content);

        match self.transport.set_metadata(patch).await {
            Ok(()) => {
                tracing::debug!(page_id = %page_id, bytes, evicted = ?evicted, "mirrored page into shared cache");
                SharedWrite::Committed { evicted, bytes }
            }
            Err(e) => {
                tracing::warn!(page_id = %page_id, error = %e, "shared cache write failed");
                SharedWrite::Unavailable
            }
        }
    }

    /// Drop one page from the mirror.
    pub async fn remove(&self, page_id: &str) -> SharedWrite {
        self.rewrite(|entries| {
            entries.remove(page_id);
        })
        .await
    }

    /// Drop every mirrored page.
    pub async fn clear(&self) -> SharedWrite {
        self.rewrite(BTreeMap::clear).await
    }

    async fn rewrite(&self, edit: impl FnOnce(&mut ContentMap)) -> SharedWrite {
        if !self.role.is_authoritative().await {
            return SharedWrite::NotAuthoritative;
        }
        let Some(doc) = self.document().await else {
            return SharedWrite::Unavailable;
        };
        let mut entries = doc.content_cache;
        edit(&mut entries);
        let bytes = size::serialized_size(&entries).unwrap_or_default();
        self.commit("*", entries, Vec::new(), bytes).await
    }

    /// Publish the visible subset of the vault into the document, if it fits.
    ///
    /// Never evicts page entries to make room for the tree.
    pub async fn set_visible_tree(&self, tree: Value) -> SharedWrite {
        if !self.role.is_authoritative().await {
            return SharedWrite::NotAuthoritative;
        }
        let mut candidate = match self.transport.get_metadata().await {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(error = %e, "shared document unavailable");
                return SharedWrite::Unavailable;
            }
        };
        candidate.insert(VISIBLE_TREE_KEY.to_string(), tree.clone());

        let bytes = match size::check(&candidate, self.config.safe_limit()) {
            Ok(check) if check.fits() => check.bytes,
            Ok(check) => {
                tracing::warn!(bytes = check.bytes, limit = check.limit, "visible tree does not fit the shared document");
                self.events
                    .emit(CacheEvent::SharedWriteAbandoned { page_id: VISIBLE_TREE_KEY.to_string(), bytes: check.bytes });
                return SharedWrite::Abandoned { bytes: check.bytes };
            }
            Err(e) => {
                tracing::warn!(error = %e, "visible tree not serializable");
                return SharedWrite::Unavailable;
            }
        };

        let mut patch = Map::new();
        patch.insert(VISIBLE_TREE_KEY.to_string(), tree);
        match self.transport.set_metadata(patch).await {
            Ok(()) => SharedWrite::Committed { evicted: Vec::new(), bytes },
            Err(e) => {
                tracing::warn!(error = %e, "visible tree write failed");
                SharedWrite::Unavailable
            }
        }
    }
}

/// Up to `n` keys with the oldest `saved_at`, never `keep`.
fn oldest_keys(entries: &ContentMap, n: usize, keep: &str) -> Vec<String> {
    let mut candidates: Vec<_> = entries
        .iter()
        .filter(|(key, _)| key.as_str() != keep)
        .map(|(key, entry)| (entry.saved_at, key.clone()))
        .collect();
    candidates.sort();
    candidates.into_iter().take(n).map(|(_, key)| key).collect()
}
