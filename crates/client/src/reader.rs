//! Viewer read path.
//!
//! A page is looked up in RenderCache, then LocalBlockCache, then the shared
//! room mirror, and finally requested from the host. Whatever a slower tier
//! returns is written back into the faster local tiers.

use std::sync::Arc;

use serde_json::Value;

use vault_sync_core::cache::{LocalBlockCache, PageInfoCache, RenderCache, SharedRoomCache};
use vault_sync_core::model::{Blocks, PageInfo};
use vault_sync_core::sync::{ContentResponse, RequestOutcome, SyncClient};

/// Tier a page was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource {
    Render,
    Local,
    Shared,
    Host,
}

/// What the viewer has for a page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageContent {
    pub page_id: String,
    pub blocks: Option<Blocks>,
    pub html: Option<String>,
    pub page_info: Option<PageInfo>,
    pub source: ContentSource,
}

/// Per-session viewer caches plus the request client.
#[derive(Clone)]
pub struct VaultReader {
    render: Arc<RenderCache>,
    blocks: LocalBlockCache,
    page_info: PageInfoCache,
    shared: Option<SharedRoomCache>,
    client: SyncClient,
}

impl VaultReader {
    /// `shared` is `None` when this viewer cannot see the shared document.
    pub fn new(
        render: Arc<RenderCache>, blocks: LocalBlockCache, page_info: PageInfoCache, shared: Option<SharedRoomCache>,
        client: SyncClient,
    ) -> Self {
        Self { render, blocks, page_info, shared, client }
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

    /// Best available content for `page_id`, or `None` if no tier and no host has it.
    pub async fn read_page(&self, page_id: &str) -> Option<PageContent> {
        let cached_info = self.page_info.get(page_id).await.map(|entry| entry.info);

        if let Some(html) = self.render.get(page_id).await {
            tracing::debug!(page_id, "render cache hit");
            let blocks = self.blocks.get(page_id).await;
            return Some(content(page_id, blocks, Some(html), cached_info, ContentSource::Render));
        }

        if let Some(blocks) = self.blocks.get(page_id).await {
            tracing::debug!(page_id, "local block cache hit");
            return Some(content(page_id, Some(blocks), None, cached_info, ContentSource::Local));
        }

        if let Some(blocks) = self.read_shared(page_id).await {
            tracing::debug!(page_id, "shared mirror hit");
            self.blocks.set(page_id, blocks.clone()).await;
            return Some(content(page_id, Some(blocks), None, cached_info, ContentSource::Shared));
        }

        self.ask_host(page_id, false).await
    }

    /// Ask the host to bypass its caches and re-fetch `page_id`.
    ///
    /// Local tiers are only touched when the host answers; the rendered copy
    /// is then dropped so later reads see the refreshed blocks.
    pub async fn refresh_page(&self, page_id: &str) -> Option<PageContent> {
        self.ask_host(page_id, true).await
    }

    async fn read_shared(&self, page_id: &str) -> Option<Blocks> {
        match self.shared.as_ref()?.get(page_id).await? {
            Value::Array(blocks) => Some(blocks),
            _ => {
                tracing::debug!(page_id, "shared mirror entry is not a block list");
                None
            }
        }
    }

    async fn ask_host(&self, page_id: &str, force_refresh: bool) -> Option<PageContent> {
        let response = match self.client.request_content(page_id, force_refresh).await {
            RequestOutcome::Resolved(response) => response,
            RequestOutcome::TimedOut => {
                tracing::warn!(page_id, force_refresh, "host did not answer in time");
                return None;
            }
            RequestOutcome::SendFailed(e) => {
                tracing::warn!(page_id, error = %e, "content request not sent");
                return None;
            }
        };

        if response.is_empty() {
            tracing::debug!(page_id, "host has no content");
            return None;
        }
        // A refreshed answer carries no html; the rendered copy is now stale.
        if force_refresh || response.html.is_none() {
            self.render.remove(page_id).await;
        }
        self.backfill(&response).await;

        Some(PageContent {
            page_id: page_id.to_string(),
            blocks: response.blocks,
            html: response.html,
            page_info: response.page_info,
            source: ContentSource::Host,
        })
    }

    /// Write a host answer into the local tiers.
    pub async fn backfill(&self, response: &ContentResponse) {
        let page_id = response.page_id.as_str();
        if let Some(blocks) = &response.blocks {
            self.blocks.set(page_id, blocks.clone()).await;
        }
        if let Some(html) = &response.html {
            self.render.insert(page_id, html.clone()).await;
        }
        if let Some(info) = &response.page_info {
            self.page_info.set(page_id, info.clone()).await;
        }
    }
}

fn content(
    page_id: &str, blocks: Option<Blocks>, html: Option<String>, page_info: Option<PageInfo>, source: ContentSource,
) -> PageContent {
    PageContent { page_id: page_id.to_string(), blocks, html, page_info, source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vault_sync_core::CacheDb;
    use vault_sync_core::config::{ProtocolConfig, SharedConfig};
    use vault_sync_core::events::CacheEvents;
    use vault_sync_core::transport::{MemoryRoom, StaticRole};

    async fn reader(room: &MemoryRoom, with_shared: bool) -> VaultReader {
        let db = Arc::new(CacheDb::open_in_memory().await.unwrap());
        let events = CacheEvents::new();
        let shared = with_shared.then(|| {
            SharedRoomCache::new(
                Arc::new(room.clone()),
                Arc::new(StaticRole::new(false)),
                SharedConfig::default(),
                events.clone(),
            )
        });
        VaultReader::new(
            Arc::new(RenderCache::new(20)),
            LocalBlockCache::new(db.clone(), events.clone()),
            PageInfoCache::new(db, events),
            shared,
            SyncClient::new(Arc::new(room.clone()), ProtocolConfig::default()),
        )
    }

    #[tokio::test]
    async fn test_render_tier_wins() {
        let room = MemoryRoom::new();
        let viewer = reader(&room, false).await;
        viewer.render().insert("p1", "<p>hi</p>".into()).await;
        viewer.blocks().set("p1", vec![json!(1)]).await;

        let page = viewer.read_page("p1").await.unwrap();

        assert_eq!(page.source, ContentSource::Render);
        assert_eq!(page.html.as_deref(), Some("<p>hi</p>"));
        assert_eq!(page.blocks, Some(vec![json!(1)]));
    }

    #[tokio::test]
    async fn test_shared_hit_backfills_local() {
        let room = MemoryRoom::new();
        let host = SharedRoomCache::new(
            Arc::new(room.clone()),
            Arc::new(StaticRole::new(true)),
            SharedConfig::default(),
            CacheEvents::new(),
        );
        host.insert("p1", json!([{"type": "text"}])).await;
        let viewer = reader(&room, true).await;

        let page = viewer.read_page("p1").await.unwrap();

        assert_eq!(page.source, ContentSource::Shared);
        assert_eq!(viewer.blocks().get("p1").await, Some(vec![json!({"type": "text"})]));
        assert_eq!(viewer.read_page("p1").await.unwrap().source, ContentSource::Local);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_host_reads_as_absent() {
        let room = MemoryRoom::new();
        let viewer = reader(&room, true).await;

        assert!(viewer.read_page("p1").await.is_none());
        assert!(viewer.refresh_page("p1").await.is_none());
        assert!(viewer.blocks().get("p1").await.is_none());
    }

    #[tokio::test]
    async fn test_backfill_fills_every_tier() {
        let room = MemoryRoom::new();
        let viewer = reader(&room, false).await;
        let response = ContentResponse {
            page_id: "p1".into(),
            blocks: Some(vec![json!(1)]),
            html: Some("<p>1</p>".into()),
            page_info: Some(PageInfo { cover: Some(json!("c.png")), ..Default::default() }),
        };

        viewer.backfill(&response).await;

        assert_eq!(viewer.blocks().get("p1").await, Some(vec![json!(1)]));
        assert_eq!(viewer.render().get("p1").await.as_deref(), Some("<p>1</p>"));
        assert_eq!(viewer.page_info().get("p1").await.unwrap().info.cover, Some(json!("c.png")));
    }
}
