//! Composition of every host-side tier for one hosting session.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{Heartbeat, Responder, SendError, TREE_PUSH_CHANNEL, TreePayload, publish};
use crate::cache::{KvStore, LocalBlockCache, PageInfoCache, RenderCache, SharedRoomCache, SharedWrite};
use crate::config::AppConfig;
use crate::events::{CacheEvent, CacheEvents};
use crate::model::{Blocks, BroadcastEnvelope};
use crate::transport::{HostTransport, PageFetcher, RoleOracle};

/// A running host: caches, responder and heartbeat.
///
/// Dropping the session does not stop its tasks; call [`HostSession::shutdown`].
pub struct HostSession {
    transport: Arc<dyn HostTransport>,
    render: Arc<RenderCache>,
    blocks: LocalBlockCache,
    page_info: PageInfoCache,
    shared: SharedRoomCache,
    visible_tree: Arc<RwLock<Option<Value>>>,
    events: CacheEvents,
    message_limit: usize,
    responder: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl HostSession {
    /// Build the tiers and start answering requests.
    pub fn start(
        config: &AppConfig, store: Arc<dyn KvStore>, transport: Arc<dyn HostTransport>, role: Arc<dyn RoleOracle>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let events = CacheEvents::new();
        let render = Arc::new(RenderCache::new(config.render.capacity));
        let blocks = LocalBlockCache::new(store.clone(), events.clone());
        let page_info = PageInfoCache::new(store, events.clone());
        let shared = SharedRoomCache::new(transport.clone(), role.clone(), config.shared.clone(), events.clone());
        let visible_tree = Arc::new(RwLock::new(None));
        let message_limit = config.protocol.message_limit_bytes;

        let responder = Responder {
            transport: transport.clone(),
            role: role.clone(),
            fetcher,
            render: render.clone(),
            blocks: blocks.clone(),
            page_info: page_info.clone(),
            visible_tree: visible_tree.clone(),
            events: events.clone(),
            message_limit,
        }
        .start();
        let heartbeat =
            Heartbeat::new(transport.clone(), role, config.session_name.clone(), config.presence.clone()).start();

        tracing::info!(session = %config.session_name, "host session started");

        Self {
            transport,
            render,
            blocks,
            page_info,
            shared,
            visible_tree,
            events,
            message_limit,
            responder,
            heartbeat,
        }
    }

    /// Record a freshly rendered page in every host tier.
    ///
    /// Local tiers always take the page; the shared mirror may evict or
    /// abandon, which the returned [`SharedWrite`] reports.
    pub async fn cache_page(&self, page_id: &str, blocks: Blocks, html: String) -> SharedWrite {
        self.render.insert(page_id, html).await;
        self.blocks.set(page_id, blocks.clone()).await;
        self.shared.insert(page_id, Value::Array(blocks)).await
    }

    /// Adopt `tree` as the visible subset of the vault and tell viewers.
    ///
    /// The push is fire-and-forget: viewers that miss it can still ask.
    pub async fn publish_visible_tree(&self, tree: Value) -> SharedWrite {
        *self.visible_tree.write().await = Some(tree.clone());
        let written = self.shared.set_visible_tree(tree.clone()).await;

        let envelope = BroadcastEnvelope::new(None, TreePayload { tree: Some(tree) });
        match publish(self.transport.as_ref(), TREE_PUSH_CHANNEL, &envelope, self.message_limit).await {
            Ok(()) => {}
            Err(SendError::SizeExceeded { channel, size_kb, .. }) => {
                self.events.emit(CacheEvent::SizeLimitExceeded { channel, size_kb });
            }
            Err(e) => tracing::warn!(error = %e, "visible tree push not sent"),
        }
        written
    }

    pub fn render(&self) -> &RenderCache {
        &self.render
    }

    pub fn blocks(&self) -> &LocalBlockCache {
        &self.blocks
    }

    pub fn page_info(&self) -> &PageInfoCache {
        &self.page_info
    }

    pub fn shared(&self) -> &SharedRoomCache {
        &self.shared
    }

    pub fn events(&self) -> &CacheEvents {
        &self.events
    }

    /// Stop answering and stop the heartbeat. In-flight viewer requests time out.
    pub fn shutdown(self) {
        self.responder.abort();
        self.heartbeat.abort();
        tracing::info!("host session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::cache::CacheDb;
    use crate::config::ProtocolConfig;
    use crate::model::PageInfo;
    use crate::sync::{CONTENT_REQUEST_CHANNEL, SyncClient, TreeMirror};
    use crate::transport::{MemoryRoom, StaticRole};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct NoOrigin;

    #[async_trait]
    impl PageFetcher for NoOrigin {
        async fn fetch_blocks(&self, _page_id: &str) -> Result<Option<Blocks>, Error> {
            Ok(None)
        }

        async fn fetch_page_info(&self, _page_id: &str) -> Result<Option<PageInfo>, Error> {
            Ok(None)
        }
    }

    async fn session(room: &MemoryRoom) -> HostSession {
        let db = Arc::new(CacheDb::open_in_memory().await.unwrap());
        HostSession::start(
            &AppConfig::default(),
            db,
            Arc::new(room.clone()),
            Arc::new(StaticRole::new(true)),
            Arc::new(NoOrigin),
        )
    }

    #[tokio::test]
    async fn test_cache_page_fills_every_tier() {
        let room = MemoryRoom::new();
        let host = session(&room).await;
        let blocks = vec![json!({"type": "heading"}), json!({"type": "text"})];

        let written = host.cache_page("p1", blocks.clone(), "<h1>P1</h1>".into()).await;

        assert!(written.is_committed());
        assert_eq!(host.render().get("p1").await.as_deref(), Some("<h1>P1</h1>"));
        assert_eq!(host.blocks().get("p1").await, Some(blocks.clone()));
        assert_eq!(host.shared().get("p1").await, Some(Value::Array(blocks)));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_publish_visible_tree_reaches_mirror_and_document() {
        let room = MemoryRoom::new();
        let host = session(&room).await;
        let mirror = TreeMirror::start(Arc::new(room.clone()));
        let tree = json!({"root": ["p1", "p2"]});

        assert!(host.publish_visible_tree(tree.clone()).await.is_committed());
        assert_eq!(host.shared().visible_tree().await, Some(tree.clone()));

        for _ in 0..50 {
            if mirror.get().await.as_ref() == Some(&tree) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mirror.get().await, Some(tree.clone()));

        let client = SyncClient::new(Arc::new(room.clone()), ProtocolConfig::default());
        assert_eq!(client.request_visible_tree().await.into_option(), Some(Some(tree)));
        host.shutdown();
    }

    #[tokio::test]
    async fn test_shutdown_stops_answering() {
        let room = MemoryRoom::new();
        let host = session(&room).await;
        assert_eq!(room.listener_count(CONTENT_REQUEST_CHANNEL), 1);

        host.shutdown();

        for _ in 0..50 {
            if room.listener_count(CONTENT_REQUEST_CHANNEL) == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("responder still subscribed");
    }
}
