//! cache_get tool implementation.
//!
//! Reads the cached blocks and page info for one page.

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use vault_sync_core::{LocalBlockCache, PageInfoCache};

use crate::error::HostError;

/// Parameters for the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetParams {
    /// Identifier of the page to look up.
    pub page_id: String,
}

/// Output from the cache_get tool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CacheGetOutput {
    pub page_id: String,

    /// Cached content blocks, if any.
    pub blocks: Option<Vec<Value>>,

    /// When the blocks were stored (RFC 3339).
    pub saved_at: Option<String>,

    /// Cached page metadata (icon, cover, properties), if any.
    pub page_info: Option<Value>,

    /// When the page metadata was stored (RFC 3339).
    pub page_info_cached_at: Option<String>,
}

/// Implementation of the cache_get tool.
pub async fn get_impl(
    blocks: &LocalBlockCache, page_info: &PageInfoCache, params: CacheGetParams,
) -> Result<CallToolResult, McpError> {
    let page_id = params.page_id.trim();
    if page_id.is_empty() {
        return Err(HostError::InvalidInput("page_id must not be empty".to_string()).into());
    }

    let entry = blocks.get_entry(page_id).await;
    let info = page_info.get(page_id).await;
    if entry.is_none() && info.is_none() {
        return Err(HostError::CacheMiss(page_id.to_string()).into());
    }

    let (page_info, page_info_cached_at) = match info {
        Some(entry) => {
            let value = serde_json::to_value(&entry.info).map_err(|e| HostError::Core(e.into()))?;
            (Some(value), Some(entry.cached_at.to_rfc3339()))
        }
        None => (None, None),
    };
    let output = CacheGetOutput {
        page_id: page_id.to_string(),
        saved_at: entry.as_ref().map(|e| e.saved_at.to_rfc3339()),
        blocks: entry.map(|e| e.payload),
        page_info,
        page_info_cached_at,
    };
    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| HostError::InvalidInput(format!("Failed to serialize output: {e}")))?;

    Ok(CallToolResult::success(vec![Content::text(json)]))
}
