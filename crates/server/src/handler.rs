//! MCP server handler implementation.
//!
//! This module defines the main server handler that
//! routes tool calls to the appropriate implementations.
use std::sync::Arc;

use crate::tools::cache::purge::PurgeTargets;
use crate::tools::cache::{CacheGetParams, CachePurgeParams, get_impl, purge_impl};

use rmcp::{
    ErrorData as McpError, ServerHandler,
    handler::server::{
        tool::{ToolCallContext, ToolRouter},
        wrapper::Parameters,
    },
    model::{
        CallToolRequestParam, CallToolResult, Implementation, ListToolsResult, PaginatedRequestParam, ProtocolVersion,
        ServerCapabilities, ServerInfo,
    },
    service::{RequestContext, RoleServer},
    tool, tool_router,
};
use vault_sync_core::config::ImageConfig;
use vault_sync_core::{AppConfig, CacheDb, CacheEvents, LocalBlockCache, PageInfoCache};

/// The main MCP server handler for vault-host.
#[derive(Clone)]
pub struct VaultHostServer {
    tool_router: ToolRouter<Self>,
    db: Arc<CacheDb>,
    blocks: LocalBlockCache,
    page_info: PageInfoCache,
    images: ImageConfig,
}

/// Tool router implementation using the #[tool_router] macro.
///
/// This macro generates the routing logic that maps tool names to handler methods.
#[tool_router]
impl VaultHostServer {
    /// Create a new server handler over an opened cache database.
    pub fn new(db: Arc<CacheDb>, config: &AppConfig) -> Self {
        let events = CacheEvents::new();
        Self {
            tool_router: Self::tool_router(),
            blocks: LocalBlockCache::new(db.clone(), events.clone()),
            page_info: PageInfoCache::new(db.clone(), events),
            images: config.images.clone(),
            db,
        }
    }

    /// Show what the durable caches hold for one page.
    #[tool(description = "Get the cached blocks and page info for a page id.")]
    async fn cache_get(&self, params: Parameters<CacheGetParams>) -> Result<CallToolResult, McpError> {
        get_impl(&self.blocks, &self.page_info, params.0).await
    }

    /// Clear cache tiers and/or run the image maintenance pass.
    #[tool(
        description = "Purge cached blocks, page info or images, and optionally prune the image store to its limits. Returns removal counts."
    )]
    async fn cache_purge(&self, params: Parameters<CachePurgeParams>) -> Result<CallToolResult, McpError> {
        let targets =
            PurgeTargets { db: &self.db, blocks: &self.blocks, page_info: &self.page_info, images: &self.images };
        purge_impl(targets, params.0).await
    }
}

impl ServerHandler for VaultHostServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            server_info: Implementation {
                name: "vault-host".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                ..Default::default()
            },
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self, _request: Option<PaginatedRequestParam>, _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, rmcp::model::ErrorData> {
        Ok(ListToolsResult { meta: None, tools: self.tool_router.list_all(), next_cursor: None })
    }

    async fn call_tool(
        &self, request: CallToolRequestParam, context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, rmcp::model::ErrorData> {
        self.tool_router
            .call(ToolCallContext::new(self, request, context))
            .await
    }
}
