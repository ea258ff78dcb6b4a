//! Viewer-side pieces of vault-sync.
//!
//! This crate provides the image cache (in-memory front, durable store,
//! de-duplicated downloads) and the viewer read path that falls back from
//! local tiers to the shared mirror and finally to the host.

pub mod images;
pub mod reader;

pub use images::{GetOptions, HttpImageSource, HttpSourceConfig, ImageCache, ImageHandle, ImageSource};
pub use reader::{ContentSource, PageContent, VaultReader};
