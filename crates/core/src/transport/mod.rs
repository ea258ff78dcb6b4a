//! Contracts consumed from the host environment.
//!
//! - [`HostTransport`]: shared metadata document plus named broadcast channels
//! - [`RoleOracle`]: whether this session is currently authoritative
//! - [`PageFetcher`]: origin content provider, used by the responder on a miss
//!
//! [`MemoryRoom`] is an in-process transport for tests and loopback setups.

mod memory;

pub use memory::MemoryRoom;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::Error;
use crate::model::{Blocks, PageInfo};

/// Failures reported by a [`HostTransport`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The payload exceeded the transport's message ceiling.
    #[error("message of {bytes} bytes exceeds the transport limit")]
    SizeLimit { bytes: usize },

    /// The transport is not connected or refused the call.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Live registration on a broadcast channel.
///
/// Messages arrive through [`Subscription::recv`]. Dropping the subscription
/// unregisters it.
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<Value>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(receiver: mpsc::UnboundedReceiver<Value>, unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self { receiver, unsubscribe: Some(Box::new(unsubscribe)) }
    }

    /// Next message, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Host SDK transport and storage primitives.
#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Local copy of the shared metadata document.
    async fn get_metadata(&self) -> Result<Map<String, Value>, TransportError>;

    /// Merge `patch` into the shared document, last write wins per top-level key.
    async fn set_metadata(&self, patch: Map<String, Value>) -> Result<(), TransportError>;

    /// Publish on a named channel. Best-effort, no persistence.
    async fn send_message(&self, channel: &str, payload: Value) -> Result<(), TransportError>;

    /// Register for messages on `channel`.
    fn on_message(&self, channel: &str) -> Subscription;
}

/// Decides whether this session may write shared state and answer requests.
#[async_trait]
pub trait RoleOracle: Send + Sync {
    async fn is_authoritative(&self) -> bool;
}

/// Fixed role, toggled explicitly.
#[derive(Debug, Default)]
pub struct StaticRole(std::sync::atomic::AtomicBool);

impl StaticRole {
    pub fn new(authoritative: bool) -> Self {
        Self(std::sync::atomic::AtomicBool::new(authoritative))
    }

    pub fn set(&self, authoritative: bool) {
        self.0.store(authoritative, std::sync::atomic::Ordering::Relaxed);
    }
}

#[async_trait]
impl RoleOracle for StaticRole {
    async fn is_authoritative(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Origin content provider.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_blocks(&self, page_id: &str) -> Result<Option<Blocks>, Error>;

    async fn fetch_page_info(&self, page_id: &str) -> Result<Option<PageInfo>, Error>;
}
