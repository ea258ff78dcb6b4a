//! Viewer-side copy of the visible tree.
//!
//! The host pushes the whole tree after every edit; each push replaces the
//! local copy outright, so duplicate or reordered pushes are harmless.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{RequestOutcome, SyncClient, TREE_PUSH_CHANNEL, TreePayload};
use crate::model::BroadcastEnvelope;
use crate::transport::HostTransport;

/// Latest visible tree seen by this viewer.
pub struct TreeMirror {
    tree: Arc<RwLock<Option<Value>>>,
    listener: JoinHandle<()>,
}

impl TreeMirror {
    /// Subscribe to tree pushes. The subscription is live when this returns.
    pub fn start(transport: Arc<dyn HostTransport>) -> Self {
        let tree = Arc::new(RwLock::new(None));
        let mut pushes = transport.on_message(TREE_PUSH_CHANNEL);
        let target = tree.clone();

        let listener = tokio::spawn(async move {
            while let Some(raw) = pushes.recv().await {
                match serde_json::from_value::<BroadcastEnvelope<TreePayload>>(raw) {
                    Ok(envelope) => {
                        tracing::debug!("visible tree replaced from push");
                        *target.write().await = envelope.payload.tree;
                    }
                    Err(e) => tracing::debug!(error = %e, "ignoring malformed tree push"),
                }
            }
        });

        Self { tree, listener }
    }

    pub async fn get(&self) -> Option<Value> {
        self.tree.read().await.clone()
    }

    /// Ask the host for the current tree and adopt it.
    ///
    /// A timeout leaves the current copy untouched.
    pub async fn refresh(&self, client: &SyncClient) -> Option<Value> {
        match client.request_visible_tree().await {
            RequestOutcome::Resolved(tree) => {
                *self.tree.write().await = tree.clone();
                tree
            }
            RequestOutcome::TimedOut | RequestOutcome::SendFailed(_) => self.get().await,
        }
    }
}

impl Drop for TreeMirror {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::sync::publish;
    use crate::transport::MemoryRoom;
    use serde_json::json;
    use std::time::Duration;

    async fn push(room: &MemoryRoom, tree: Option<Value>) {
        let envelope = BroadcastEnvelope::new(None, TreePayload { tree });
        publish(room, TREE_PUSH_CHANNEL, &envelope, 65_536).await.unwrap();
    }

    async fn eventually(mirror: &TreeMirror, expected: Option<Value>) {
        for _ in 0..50 {
            if mirror.get().await == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("mirror never reached {expected:?}");
    }

    #[tokio::test]
    async fn test_push_replaces_whole_tree() {
        let room = MemoryRoom::new();
        let mirror = TreeMirror::start(Arc::new(room.clone()));

        push(&room, Some(json!({"root": ["a", "b"]}))).await;
        eventually(&mirror, Some(json!({"root": ["a", "b"]}))).await;

        push(&room, Some(json!({"root": ["c"]}))).await;
        push(&room, Some(json!({"root": ["c"]}))).await;
        eventually(&mirror, Some(json!({"root": ["c"]}))).await;
    }

    #[tokio::test]
    async fn test_drop_releases_subscription() {
        let room = MemoryRoom::new();
        let mirror = TreeMirror::start(Arc::new(room.clone()));
        assert_eq!(room.listener_count(TREE_PUSH_CHANNEL), 1);

        drop(mirror);
        for _ in 0..50 {
            if room.listener_count(TREE_PUSH_CHANNEL) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("push listener still registered");
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_timeout_keeps_current_copy() {
        let room = MemoryRoom::new();
        let mirror = TreeMirror::start(Arc::new(room.clone()));
        push(&room, Some(json!({"root": []}))).await;
        eventually(&mirror, Some(json!({"root": []}))).await;

        let client = SyncClient::new(Arc::new(room.clone()), ProtocolConfig::default());
        assert_eq!(mirror.refresh(&client).await, Some(json!({"root": []})));
    }
}
