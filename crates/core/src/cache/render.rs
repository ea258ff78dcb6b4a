//! In-memory cache of fully rendered pages.
//!
//! Lives for one client session. Capacity is small and fixed, so eviction is
//! a linear scan for the oldest entry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct RenderEntry {
    html: String,
    saved_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal timestamps.
    seq: u64,
}

#[derive(Debug, Default)]
struct RenderState {
    entries: HashMap<String, RenderEntry>,
    next_seq: u64,
}

/// Capacity-bounded mapping from page id to rendered HTML.
#[derive(Debug)]
pub struct RenderCache {
    state: Mutex<RenderState>,
    capacity: usize,
}

impl RenderCache {
    pub fn new(capacity: usize) -> Self {
        Self { state: Mutex::new(RenderState::default()), capacity }
    }

    pub async fn get(&self, page_id: &str) -> Option<String> {
        self.state.lock().await.entries.get(page_id).map(|e| e.html.clone())
    }

    /// Insert or replace. A new key at capacity evicts the single oldest entry.
    ///
    /// Returns the evicted page id, if any.
    pub async fn insert(&self, page_id: &str, html: String) -> Option<String> {
        let mut state = self.state.lock().await;

        let mut evicted = None;
        if !state.entries.contains_key(page_id) && state.entries.len() >= self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.saved_at, e.seq))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                state.entries.remove(&oldest);
                tracing::debug!(page_id = %oldest, "evicted rendered page");
                evicted = Some(oldest);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(page_id.to_string(), RenderEntry { html, saved_at: Utc::now(), seq });
        evicted
    }

    pub async fn remove(&self, page_id: &str) -> bool {
        self.state.lock().await.entries.remove(page_id).is_some()
    }

    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
