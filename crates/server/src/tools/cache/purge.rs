//! cache_purge tool implementation.
//!
//! Clears durable cache tiers and runs image maintenance.

use rmcp::{
    ErrorData as McpError,
    model::{CallToolResult, Content},
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use vault_sync_core::cache::PruneLimits;
use vault_sync_core::config::ImageConfig;
use vault_sync_core::{CacheDb, LocalBlockCache, PageInfoCache};

use crate::error::HostError;

/// Parameters for the cache_purge tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeParams {
    /// Clear every cached block list.
    #[serde(default)]
    pub blocks: bool,

    /// Clear every cached page info entry.
    #[serde(default)]
    pub page_info: bool,

    /// Clear the image store.
    #[serde(default)]
    pub images: bool,

    /// Prune the image store to its count and byte limits.
    #[serde(default)]
    pub maintenance: bool,
}

/// Output from the cache_purge tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct CachePurgeOutput {
    pub blocks_removed: usize,
    pub page_info_removed: usize,
    pub images_removed: u64,
    pub images_pruned: u64,
}

/// Durable tiers the purge tool operates on.
pub struct PurgeTargets<'a> {
    pub db: &'a CacheDb,
    pub blocks: &'a LocalBlockCache,
    pub page_info: &'a PageInfoCache,
    pub images: &'a ImageConfig,
}

/// Implementation of the cache_purge tool.
pub async fn purge_impl(targets: PurgeTargets<'_>, params: CachePurgeParams) -> Result<CallToolResult, McpError> {
    if !(params.blocks || params.page_info || params.images || params.maintenance) {
        return Err(HostError::InvalidInput(
            "At least one of blocks, page_info, images, or maintenance must be set".to_string(),
        )
        .into());
    }

    let mut output = CachePurgeOutput::default();

    if params.blocks {
        output.blocks_removed = targets.blocks.clear_all().await;
    }

    if params.page_info {
        output.page_info_removed = targets.page_info.clear_all().await;
    }

    if params.images {
        output.images_removed = targets.db.clear_images().await.map_err(HostError::from)?;
    }

    if params.maintenance {
        let limits = PruneLimits {
            max_entries: targets.images.max_entries,
            max_bytes: targets.images.max_bytes,
            target_bytes: targets.images.prune_target_bytes(),
        };
        output.images_pruned = targets.db.prune_images(limits).await.map_err(HostError::from)?.deleted;
    }

    tracing::info!(
        blocks = output.blocks_removed,
        page_info = output.page_info_removed,
        images = output.images_removed,
        pruned = output.images_pruned,
        "purged caches"
    );

    let json = serde_json::to_string_pretty(&output)
        .map_err(|e| HostError::InvalidInput(format!("Failed to serialize output: {e}")))?;

    Ok(CallToolResult::success(vec![Content::text(json)]))
}
