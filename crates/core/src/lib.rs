//! Core of vault-sync: cache tiers and the host/viewer sync protocol.
//!
//! This crate provides:
//! - Durable SQLite stores (key/value and images) and the local cache tiers
//! - The shared room mirror with size-bounded eviction
//! - Broadcast request/response between the host and viewers
//! - Unified error types and layered configuration

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod size;
pub mod sync;
pub mod transport;

pub use cache::{CacheDb, KvStore, LocalBlockCache, PageInfoCache, RenderCache, SharedRoomCache, SharedWrite};
pub use config::AppConfig;
pub use error::Error;
pub use events::{CacheEvent, CacheEvents};
pub use sync::{HostSession, RequestOutcome, SyncClient, TreeMirror};
pub use transport::{HostTransport, MemoryRoom, PageFetcher, RoleOracle, StaticRole};
