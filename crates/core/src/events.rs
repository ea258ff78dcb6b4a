//! Typed notifications emitted by the cache tiers.
//!
//! Caches report limit conditions here instead of calling into UI code; a
//! presentation layer subscribes and decides how to tell the user.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Limit conditions worth surfacing outside the cache layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// A durable store refused a write for lack of space.
    QuotaExceeded { tier: &'static str },

    /// A broadcast payload was rejected for exceeding the message ceiling.
    SizeLimitExceeded { channel: String, size_kb: f64 },

    /// A shared document write could not be made to fit and was dropped.
    SharedWriteAbandoned { page_id: String, bytes: usize },
}

/// Fan-out of [`CacheEvent`]s, cloned into every tier of one session.
#[derive(Debug, Clone)]
pub struct CacheEvents {
    sender: broadcast::Sender<CacheEvent>,
    quota_reported: Arc<AtomicBool>,
}

impl Default for CacheEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender, quota_reported: Arc::new(AtomicBool::new(false)) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }

    /// Report a quota failure. Only the first one per session reaches subscribers.
    pub fn quota_exceeded(&self, tier: &'static str) {
        if self.quota_reported.swap(true, Ordering::Relaxed) {
            return;
        }
        self.emit(CacheEvent::QuotaExceeded { tier });
    }
}
