//! Two-level image cache.
//!
//! ```text
//! get(url)
//!   ├─ non-cacheable? ──────────────► download, nothing stored
//!   ├─ pending[url] ────────────────► join the in-flight load
//!   ├─ front (in memory, 30) ───────► hit
//!   ├─ CacheDb images (within ttl) ─► touch, promote to front
//!   └─ download (primary, then fallback) ─► persist, promote to front
//! ```
//!
//! Every failure degrades to `None`.

pub mod policy;
pub mod source;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;

use vault_sync_core::cache::{CacheDb, ImageRecord, PruneLimits, PruneReport};
use vault_sync_core::config::ImageConfig;
use vault_sync_core::events::CacheEvents;

pub use policy::{Bypass, bypass_reason, is_cacheable};
pub use source::{DownloadedImage, FetchMode, HttpImageSource, HttpSourceConfig, ImageSource};

/// A materialized image, cheap to clone.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHandle {
    pub url: String,
    pub bytes: Bytes,
    pub content_type: Option<String>,
    pub cached_at: DateTime<Utc>,
}

impl ImageHandle {
    fn from_record(record: ImageRecord) -> Self {
        Self {
            url: record.url,
            bytes: Bytes::from(record.blob),
            content_type: record.content_type,
            cached_at: record.cached_at,
        }
    }

    fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        is_fresh(self.cached_at, ttl, now)
    }
}

fn is_fresh(cached_at: DateTime<Utc>, ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.signed_duration_since(cached_at) <= ttl
}

/// Options for [`ImageCache::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Overrides the configured ttl.
    pub ttl: Option<Duration>,

    /// Skip both cache reads. The download is still stored.
    pub skip_cache: bool,
}

/// In-memory front of at most `capacity` handles, evicting the oldest `cached_at`.
struct FrontCache {
    entries: HashMap<String, ImageHandle>,
    capacity: usize,
}

impl FrontCache {
    fn get(&self, url: &str) -> Option<ImageHandle> {
        self.entries.get(url).cloned()
    }

    fn insert(&mut self, handle: ImageHandle) {
        if !self.entries.contains_key(&handle.url) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .values()
                .min_by_key(|h| h.cached_at)
                .map(|h| h.url.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
                tracing::debug!(url = %oldest, "evicted image from front cache");
            }
        }
        self.entries.insert(handle.url.clone(), handle);
    }

    fn remove(&mut self, url: &str) {
        self.entries.remove(url);
    }
}

type Pending = HashMap<String, Arc<OnceCell<Option<ImageHandle>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Image cache over a [`CacheDb`] and an [`ImageSource`].
pub struct ImageCache {
    db: Arc<CacheDb>,
    source: Arc<dyn ImageSource>,
    config: ImageConfig,
    events: CacheEvents,
    front: Mutex<FrontCache>,
    pending: Mutex<Pending>,
}

impl ImageCache {
    /// Build the cache and run the maintenance pass once.
    pub async fn open(db: Arc<CacheDb>, source: Arc<dyn ImageSource>, config: ImageConfig, events: CacheEvents) -> Self {
        let cache = Self {
            front: Mutex::new(FrontCache { entries: HashMap::new(), capacity: config.front_capacity }),
            pending: Mutex::new(HashMap::new()),
            db,
            source,
            config,
            events,
        };
        cache.maintain().await;
        cache
    }

    /// Prune the durable store to the configured count and byte limits.
    pub async fn maintain(&self) -> PruneReport {
        let limits = PruneLimits {
            max_entries: self.config.max_entries,
            max_bytes: self.config.max_bytes,
            target_bytes: self.config.prune_target_bytes(),
        };
        match self.db.prune_images(limits).await {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "image maintenance failed");
                PruneReport::default()
            }
        }
    }

    pub async fn get(&self, url: &str, options: GetOptions) -> Option<ImageHandle> {
        if let Some(reason) = bypass_reason(url) {
            tracing::debug!(url, ?reason, "image bypasses cache");
            let image = self.download(url).await?;
            return Some(ImageHandle {
                url: url.to_string(),
                bytes: image.bytes,
                content_type: image.content_type,
                cached_at: Utc::now(),
            });
        }

        let cell = lock(&self.pending).entry(url.to_string()).or_default().clone();
        let handle = cell.get_or_init(|| self.load(url, options)).await.clone();

        let mut pending = lock(&self.pending);
        if pending.get(url).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            pending.remove(url);
        }
        handle
    }

    async fn load(&self, url: &str, options: GetOptions) -> Option<ImageHandle> {
        let ttl = options.ttl.unwrap_or_else(|| self.config.ttl());
        let now = Utc::now();

        if !options.skip_cache {
            let front_hit = lock(&self.front).get(url);
            if let Some(handle) = front_hit {
                if handle.is_fresh(ttl, now) {
                    tracing::debug!(url, "image front cache hit");
                    return Some(handle);
                }
                lock(&self.front).remove(url);
            }

            if let Some(handle) = self.load_durable(url, ttl, now).await {
                lock(&self.front).insert(handle.clone());
                return Some(handle);
            }
        }

        let image = self.download(url).await?;
        let record = ImageRecord::new(url, image.bytes.to_vec(), image.content_type.clone());
        let handle = ImageHandle {
            url: url.to_string(),
            bytes: image.bytes,
            content_type: image.content_type,
            cached_at: record.cached_at,
        };

        if let Err(e) = self.db.put_image(&record).await {
            if e.is_quota() {
                self.events.quota_exceeded("images");
            }
            tracing::warn!(url, error = %e, "image not persisted");
        }
        lock(&self.front).insert(handle.clone());
        Some(handle)
    }

    async fn load_durable(&self, url: &str, ttl: Duration, now: DateTime<Utc>) -> Option<ImageHandle> {
        let record = match self.db.get_image(url).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(url, error = %e, "image store read failed");
                return None;
            }
        };
        if !is_fresh(record.cached_at, ttl, now) {
            tracing::debug!(url, "stored image expired");
            return None;
        }
        if let Err(e) = self.db.touch_image(url, now).await {
            tracing::warn!(url, error = %e, "failed to touch stored image");
        }
        tracing::debug!(url, "image store hit");
        Some(ImageHandle::from_record(record))
    }

    async fn download(&self, url: &str) -> Option<DownloadedImage> {
        match self.source.download(url, FetchMode::Primary).await {
            Ok(image) => return Some(image),
            Err(e) => tracing::debug!(url, error = %e, "primary image download failed, retrying bare"),
        }
        match self.source.download(url, FetchMode::Fallback).await {
            Ok(image) => Some(image),
            Err(e) => {
                tracing::warn!(url, error = %e, "image download failed");
                None
            }
        }
    }

    /// Number of handles held in memory.
    pub fn front_len(&self) -> usize {
        lock(&self.front).entries.len()
    }

    /// Release every in-memory handle, then empty the durable store.
    pub async fn clear_all(&self) -> u64 {
        lock(&self.front).entries.clear();
        match self.db.clear_images().await {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "failed to clear image store");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vault_sync_core::Error;

    #[derive(Default)]
    struct StubSource {
        primary_fails: bool,
        always_fails: bool,
        primary_calls: AtomicUsize,
        fallback_calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageSource for StubSource {
        async fn download(&self, url: &str, mode: FetchMode) -> Result<DownloadedImage, Error> {
            match mode {
                FetchMode::Primary => self.primary_calls.fetch_add(1, Ordering::SeqCst),
                FetchMode::Fallback => self.fallback_calls.fetch_add(1, Ordering::SeqCst),
            };
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.always_fails || (self.primary_fails && mode == FetchMode::Primary) {
                return Err(Error::FetchFailed("refused".into()));
            }
            Ok(DownloadedImage { bytes: Bytes::from(url.as_bytes().to_vec()), content_type: Some("image/png".into()) })
        }
    }

    impl StubSource {
        fn calls(&self) -> usize {
            self.primary_calls.load(Ordering::SeqCst) + self.fallback_calls.load(Ordering::SeqCst)
        }
    }

    async fn cache_with(source: Arc<StubSource>, config: ImageConfig) -> (ImageCache, Arc<CacheDb>) {
        let db = Arc::new(CacheDb::open_in_memory().await.unwrap());
        let cache = ImageCache::open(db.clone(), source, config, CacheEvents::new()).await;
        (cache, db)
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_download() {
        let source = Arc::new(StubSource::default());
        let (cache, _) = cache_with(source.clone(), ImageConfig::default()).await;
        let url = "https://img.example/a.png";

        let (a, b, c) = tokio::join!(
            cache.get(url, GetOptions::default()),
            cache.get(url, GetOptions::default()),
            cache.get(url, GetOptions::default()),
        );

        assert_eq!(source.calls(), 1);
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[tokio::test]
    async fn test_durable_hit_after_front_cleared() {
        let source = Arc::new(StubSource::default());
        let (cache, db) = cache_with(source.clone(), ImageConfig::default()).await;
        let url = "https://img.example/a.png";

        cache.get(url, GetOptions::default()).await.unwrap();
        let before = db.get_image(url).await.unwrap().unwrap().last_accessed;
        lock(&cache.front).entries.clear();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let handle = cache.get(url, GetOptions::default()).await.unwrap();

        assert_eq!(handle.bytes, Bytes::from_static(b"https://img.example/a.png"));
        assert_eq!(source.calls(), 1);
        assert_eq!(cache.front_len(), 1);
        assert!(db.get_image(url).await.unwrap().unwrap().last_accessed > before);
    }

    #[tokio::test]
    async fn test_expired_entry_is_downloaded_again() {
        let source = Arc::new(StubSource::default());
        let (cache, db) = cache_with(source.clone(), ImageConfig::default()).await;
        let url = "https://img.example/old.png";
        let mut stale = ImageRecord::new(url, b"old".to_vec(), None);
        stale.cached_at = Utc::now() - chrono::Duration::days(30);
        db.put_image(&stale).await.unwrap();

        let handle = cache.get(url, GetOptions::default()).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(handle.bytes, Bytes::from_static(b"https://img.example/old.png"));
    }

    #[tokio::test]
    async fn test_skip_cache_downloads_but_persists() {
        let source = Arc::new(StubSource::default());
        let (cache, db) = cache_with(source.clone(), ImageConfig::default()).await;
        let url = "https://img.example/a.png";
        cache.get(url, GetOptions::default()).await;

        cache.get(url, GetOptions { skip_cache: true, ..Default::default() }).await.unwrap();

        assert_eq!(source.calls(), 2);
        assert!(db.get_image(url).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fallback_after_primary_failure() {
        let source = Arc::new(StubSource { primary_fails: true, ..Default::default() });
        let (cache, _) = cache_with(source.clone(), ImageConfig::default()).await;

        assert!(cache.get("https://img.example/a.png", GetOptions::default()).await.is_some());
        assert_eq!(source.primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(source.fallback_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_download_failure_is_none() {
        let source = Arc::new(StubSource { always_fails: true, ..Default::default() });
        let (cache, db) = cache_with(source, ImageConfig::default()).await;

        assert!(cache.get("https://img.example/a.png", GetOptions::default()).await.is_none());
        assert_eq!(db.image_stats().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_signed_url_is_never_stored() {
        let source = Arc::new(StubSource::default());
        let (cache, db) = cache_with(source.clone(), ImageConfig::default()).await;
        let url = "https://bucket.s3.amazonaws.com/a.png?X-Amz-Signature=abc";

        assert!(cache.get(url, GetOptions::default()).await.is_some());
        assert!(cache.get(url, GetOptions::default()).await.is_some());

        assert_eq!(source.calls(), 2);
        assert_eq!(db.image_stats().await.unwrap().count, 0);
        assert_eq!(cache.front_len(), 0);
    }

    #[tokio::test]
    async fn test_front_cache_is_bounded() {
        let source = Arc::new(StubSource::default());
        let config = ImageConfig { front_capacity: 2, ..Default::default() };
        let (cache, _) = cache_with(source, config).await;

        for i in 0..3 {
            cache.get(&format!("https://img.example/{i}.png"), GetOptions::default()).await;
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(cache.front_len(), 2);
        assert!(lock(&cache.front).get("https://img.example/0.png").is_none());
    }

    #[tokio::test]
    async fn test_open_runs_maintenance() {
        let db = Arc::new(CacheDb::open_in_memory().await.unwrap());
        for i in 0..5 {
            db.put_image(&ImageRecord::new(format!("https://img.example/{i}.png"), vec![0; 10], None))
                .await
                .unwrap();
        }
        let config = ImageConfig { max_entries: 3, ..Default::default() };

        ImageCache::open(db.clone(), Arc::new(StubSource::default()), config, CacheEvents::new()).await;

        assert_eq!(db.image_stats().await.unwrap().count, 3);
    }

    #[tokio::test]
    async fn test_clear_all_empties_both_levels() {
        let source = Arc::new(StubSource::default());
        let (cache, db) = cache_with(source, ImageConfig::default()).await;
        cache.get("https://img.example/a.png", GetOptions::default()).await;
        cache.get("https://img.example/b.png", GetOptions::default()).await;

        assert_eq!(cache.clear_all().await, 2);
        assert_eq!(cache.front_len(), 0);
        assert_eq!(db.image_stats().await.unwrap().count, 0);
    }
}
