//! Broadcast request/response protocol between the host and viewers.
//!
//! ```text
//!  viewer (SyncClient)                         host (Responder)
//!  ───────────────────                         ────────────────
//!  subscribe content:response ─┐
//!  publish   content:request ──┼──────────────► role check
//!                              │               RenderCache / LocalBlockCache
//!                              │               or PageFetcher
//!  filter by correlation key ◄─┴────────────── publish content:response
//! ```
//!
//! The visible-tree exchange uses its own channel pair without correlation
//! keys, plus a push channel the host broadcasts on after edits.

pub mod host;
pub mod presence;
pub mod requester;
pub mod responder;
pub mod tree;

pub use host::HostSession;
pub use presence::Heartbeat;
pub use requester::{RequestOutcome, SyncClient};
pub use responder::Responder;
pub use tree::TreeMirror;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Blocks, BroadcastEnvelope, PageInfo};
use crate::size;
use crate::transport::{HostTransport, TransportError};

pub const CONTENT_REQUEST_CHANNEL: &str = "vault:content:request";
pub const CONTENT_RESPONSE_CHANNEL: &str = "vault:content:response";
pub const TREE_REQUEST_CHANNEL: &str = "vault:tree:request";
pub const TREE_RESPONSE_CHANNEL: &str = "vault:tree:response";
pub const TREE_PUSH_CHANNEL: &str = "vault:tree:push";

/// Viewer asks the host for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    pub page_id: String,
    #[serde(default)]
    pub force_refresh: bool,
}

/// Host answer to a [`ContentRequest`]. All content fields empty means "no content".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocks: Option<Blocks>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_info: Option<PageInfo>,
}

impl ContentResponse {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_none() && self.html.is_none()
    }
}

/// Visible subset of the vault, replaced whole on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreePayload {
    pub tree: Option<Value>,
}

/// Why a broadcast did not go out.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    /// Payload above the message ceiling. Never retried.
    #[error("payload for {channel} is {size_kb}KB, above the message limit")]
    SizeExceeded { channel: String, bytes: usize, size_kb: f64 },

    #[error("send on {channel} failed: {reason}")]
    Transport { channel: String, reason: String },
}

/// Serialize `envelope`, enforce `limit`, then publish on `channel`.
pub async fn publish<T: Serialize>(
    transport: &dyn HostTransport, channel: &str, envelope: &BroadcastEnvelope<T>, limit: usize,
) -> Result<(), SendError> {
    let transport_err = |reason: String| SendError::Transport { channel: channel.to_string(), reason };
    let payload = serde_json::to_value(envelope).map_err(|e| transport_err(e.to_string()))?;
    let check = size::check(&payload, limit).map_err(|e| transport_err(e.to_string()))?;

    if !check.fits() {
        return Err(size_exceeded(channel, check.bytes));
    }

    match transport.send_message(channel, payload).await {
        Ok(()) => Ok(()),
        Err(TransportError::SizeLimit { bytes }) => Err(size_exceeded(channel, bytes)),
        Err(TransportError::Unavailable(reason)) => Err(transport_err(reason)),
    }
}

fn size_exceeded(channel: &str, bytes: usize) -> SendError {
    tracing::warn!(channel, bytes, "broadcast payload exceeds the message limit");
    SendError::SizeExceeded { channel: channel.to_string(), bytes, size_kb: size::kilobytes(bytes) }
}
