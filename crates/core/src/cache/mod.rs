//! Cache tiers.
//!
//! Durable state lives in one SQLite database accessed through
//! tokio-rusqlite: a quota-bounded key/value table backing the local block
//! and page info caches, and an object table for images. The render cache is
//! in memory and the shared mirror lives in the room's metadata document.

pub mod connection;
pub mod images;
pub mod kv;
pub mod local;
pub mod migrations;
pub mod render;
pub mod shared;

pub use crate::Error;

pub use connection::CacheDb;
pub use images::{ImageRecord, ImageStats, PruneLimits, PruneReport};
pub use kv::KvStore;
pub use local::{LocalBlockCache, LocalCache, PageInfoCache};
pub use render::RenderCache;
pub use shared::{SharedRoomCache, SharedWrite};
