//! Host side of the protocol.
//!
//! Subscribes once and answers content and visible-tree requests for as long
//! as the task runs. Authority is re-checked per request: a session that
//! loses its role keeps listening but stops answering.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{
    CONTENT_REQUEST_CHANNEL, CONTENT_RESPONSE_CHANNEL, ContentRequest, ContentResponse, SendError,
    TREE_REQUEST_CHANNEL, TREE_RESPONSE_CHANNEL, TreePayload, publish,
};
use crate::cache::{LocalBlockCache, PageInfoCache, RenderCache};
use crate::events::{CacheEvent, CacheEvents};
use crate::model::BroadcastEnvelope;
use crate::transport::{HostTransport, PageFetcher, RoleOracle, Subscription};

/// Answers broadcast requests from the host's own caches or the fetcher.
#[derive(Clone)]
pub struct Responder {
    pub(crate) transport: Arc<dyn HostTransport>,
    pub(crate) role: Arc<dyn RoleOracle>,
    pub(crate) fetcher: Arc<dyn PageFetcher>,
    pub(crate) render: Arc<RenderCache>,
    pub(crate) blocks: LocalBlockCache,
    pub(crate) page_info: PageInfoCache,
    pub(crate) visible_tree: Arc<RwLock<Option<Value>>>,
    pub(crate) events: CacheEvents,
    pub(crate) message_limit: usize,
}

impl Responder {
    /// Subscribe to both request channels and serve them on a background task.
    ///
    /// Subscriptions are registered before this returns.
    pub fn start(self) -> JoinHandle<()> {
        let content = self.transport.on_message(CONTENT_REQUEST_CHANNEL);
        let tree = self.transport.on_message(TREE_REQUEST_CHANNEL);
        tokio::spawn(self.run(content, tree))
    }

    async fn run(self, mut content: Subscription, mut tree: Subscription) {
        tracing::info!("responder listening");
        loop {
            tokio::select! {
                Some(raw) = content.recv() => self.on_content_request(raw).await,
                Some(_) = tree.recv() => self.on_tree_request().await,
                else => break,
            }
        }
        tracing::info!("responder stopped");
    }

    async fn on_content_request(&self, raw: Value) {
        let envelope: BroadcastEnvelope<ContentRequest> = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "ignoring malformed content request");
                return;
            }
        };
        if !self.role.is_authoritative().await {
            tracing::debug!(page_id = %envelope.payload.page_id, "not authoritative, leaving request unanswered");
            return;
        }

        let response = self.resolve(&envelope.payload).await;
        let reply = BroadcastEnvelope::new(envelope.correlation_key, response);
        self.reply(CONTENT_RESPONSE_CHANNEL, &reply).await;
    }

    async fn on_tree_request(&self) {
        if !self.role.is_authoritative().await {
            return;
        }
        let tree = self.visible_tree.read().await.clone();
        let reply = BroadcastEnvelope::new(None, TreePayload { tree });
        self.reply(TREE_RESPONSE_CHANNEL, &reply).await;
    }

    /// Build the answer for one request.
    ///
    /// Serves from RenderCache and LocalBlockCache; on a miss, or when
    /// `force_refresh` is set, the local block entry is dropped and the
    /// fetcher is asked instead.
    pub async fn resolve(&self, request: &ContentRequest) -> ContentResponse {
        let page_id = request.page_id.as_str();

        let (html, cached_blocks) = if request.force_refresh {
            self.blocks.remove(page_id).await;
            (None, None)
        } else {
            (self.render.get(page_id).await, self.blocks.get(page_id).await)
        };

        let blocks = match (cached_blocks, &html) {
            (Some(blocks), _) => {
                tracing::debug!(page_id, "serving blocks from local cache");
                Some(blocks)
            }
            (None, Some(_)) => {
                tracing::debug!(page_id, "serving rendered html only");
                None
            }
            (None, None) => self.fetch_blocks(page_id).await,
        };

        let page_info = match self.page_info.get(page_id).await {
            Some(entry) if !request.force_refresh => Some(entry.info),
            _ => self.fetch_page_info(page_id).await,
        };

        ContentResponse { page_id: page_id.to_string(), blocks, html, page_info }
    }

    async fn fetch_blocks(&self, page_id: &str) -> Option<Vec<Value>> {
        match self.fetcher.fetch_blocks(page_id).await {
            Ok(Some(blocks)) => {
                self.blocks.set(page_id, blocks.clone()).await;
                Some(blocks)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(page_id, error = %e, "block fetch failed");
                None
            }
        }
    }

    async fn fetch_page_info(&self, page_id: &str) -> Option<crate::model::PageInfo> {
        match self.fetcher.fetch_page_info(page_id).await {
            Ok(Some(info)) => {
                self.page_info.set(page_id, info.clone()).await;
                Some(info)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(page_id, error = %e, "page info fetch failed");
                None
            }
        }
    }

    async fn reply<T: serde::Serialize>(&self, channel: &str, reply: &BroadcastEnvelope<T>) {
        match publish(self.transport.as_ref(), channel, reply, self.message_limit).await {
            Ok(()) => {}
            Err(SendError::SizeExceeded { channel, size_kb, .. }) => {
                self.events.emit(CacheEvent::SizeLimitExceeded { channel, size_kb });
            }
            Err(e) => tracing::warn!(error = %e, "reply not sent"),
        }
    }
}
