//! In-process room: one shared metadata document and per-channel fan-out.
//!
//! Every handle cloned from a room sees the same document and channels, so a
//! host and its viewers can run inside one process. Delivery is unbounded and
//! unordered across channels, like the real transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use super::{HostTransport, Subscription, TransportError};
use crate::config::TRANSPORT_MESSAGE_LIMIT;
use crate::size;

type Listeners = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Value>)>>;

struct RoomInner {
    metadata: Mutex<Map<String, Value>>,
    listeners: Mutex<Listeners>,
    next_id: AtomicU64,
    message_limit: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared in-memory transport.
#[derive(Clone)]
pub struct MemoryRoom {
    inner: Arc<RoomInner>,
}

impl Default for MemoryRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRoom {
    pub fn new() -> Self {
        Self::with_message_limit(TRANSPORT_MESSAGE_LIMIT)
    }

    pub fn with_message_limit(message_limit: usize) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                metadata: Mutex::new(Map::new()),
                listeners: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                message_limit,
            }),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        lock(&self.inner.listeners).get(channel).map_or(0, Vec::len)
    }

    /// Snapshot of the shared document.
    pub fn metadata(&self) -> Map<String, Value> {
        lock(&self.inner.metadata).clone()
    }
}

#[async_trait]
impl HostTransport for MemoryRoom {
    async fn get_metadata(&self) -> Result<Map<String, Value>, TransportError> {
        Ok(self.metadata())
    }

    async fn set_metadata(&self, patch: Map<String, Value>) -> Result<(), TransportError> {
        let mut metadata = lock(&self.inner.metadata);
        for (key, value) in patch {
            metadata.insert(key, value);
        }
        Ok(())
    }

    async fn send_message(&self, channel: &str, payload: Value) -> Result<(), TransportError> {
        let bytes = size::serialized_size(&payload).map_err(|e| TransportError::Unavailable(e.to_string()))?;
        if bytes > self.inner.message_limit {
            return Err(TransportError::SizeLimit { bytes });
        }

        let mut listeners = lock(&self.inner.listeners);
        if let Some(subscribers) = listeners.get_mut(channel) {
            subscribers.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        }
        Ok(())
    }

    fn on_message(&self, channel: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners)
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        let room: Weak<RoomInner> = Arc::downgrade(&self.inner);
        let channel = channel.to_string();
        Subscription::new(rx, move || {
            if let Some(room) = room.upgrade() {
                let mut listeners = lock(&room.listeners);
                if let Some(subscribers) = listeners.get_mut(&channel) {
                    subscribers.retain(|(sub_id, _)| *sub_id != id);
                    if subscribers.is_empty() {
                        listeners.remove(&channel);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let room = MemoryRoom::new();
        let mut a = room.on_message("ch");
        let mut b = room.clone().on_message("ch");
        let mut other = room.on_message("other");

        room.send_message("ch", json!({"n": 1})).await.unwrap();

        assert_eq!(a.recv().await, Some(json!({"n": 1})));
        assert_eq!(b.recv().await, Some(json!({"n": 1})));
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let room = MemoryRoom::new();
        let sub = room.on_message("ch");
        let _keep = room.on_message("ch");
        assert_eq!(room.listener_count("ch"), 2);
        drop(sub);
        assert_eq!(room.listener_count("ch"), 1);
    }

    #[tokio::test]
    async fn test_rejects_oversized_message() {
        let room = MemoryRoom::with_message_limit(16);
        let err = room.send_message("ch", json!("0123456789abcdefghij")).await.unwrap_err();
        assert!(matches!(err, TransportError::SizeLimit { bytes: 22 }));
    }

    #[tokio::test]
    async fn test_metadata_merges_per_key() {
        let room = MemoryRoom::new();
        let mut first = Map::new();
        first.insert("a".into(), json!(1));
        first.insert("b".into(), json!(2));
        room.set_metadata(first).await.unwrap();

        let mut second = Map::new();
        second.insert("b".into(), json!(3));
        room.set_metadata(second).await.unwrap();

        let doc = room.get_metadata().await.unwrap();
        assert_eq!(doc.get("a"), Some(&json!(1)));
        assert_eq!(doc.get("b"), Some(&json!(3)));
    }
}
