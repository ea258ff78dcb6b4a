//! Durable image object store.
//!
//! One row per URL with the binary payload, indexed by `cached_at` and
//! `last_accessed` so the maintenance pass can walk entries oldest-first
//! without loading blobs.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::{self, OptionalExtension};

use super::connection::CacheDb;
use crate::Error;

/// A stored image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub url: String,
    pub blob: Vec<u8>,
    pub size: u64,
    pub content_type: Option<String>,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(url: impl Into<String>, blob: Vec<u8>, content_type: Option<String>) -> Self {
        let now = Utc::now();
        Self { url: url.into(), size: blob.len() as u64, blob, content_type, cached_at: now, last_accessed: now }
    }
}

/// Blob-free projection used by maintenance scans.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageScanRow {
    pub url: String,
    pub size: u64,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

/// Totals across the image store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStats {
    pub count: u64,
    pub total_bytes: u64,
}

/// Limits applied by [`CacheDb::prune_images`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PruneLimits {
    pub max_entries: usize,
    pub max_bytes: u64,
    /// Byte total to shrink to once `max_bytes` is exceeded.
    pub target_bytes: u64,
}

/// What a maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub over_count: usize,
    pub over_bytes: usize,
    pub deleted: u64,
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Pick the URLs to delete from `rows` (sorted by `last_accessed` ascending).
///
/// The count excess and the byte excess are computed independently and
/// unioned.
pub fn plan_prune(rows: &[ImageScanRow], limits: PruneLimits) -> (BTreeSet<String>, PruneReport) {
    let mut victims = BTreeSet::new();
    let mut report = PruneReport::default();

    if rows.len() > limits.max_entries {
        let excess = rows.len() - limits.max_entries;
        report.over_count = excess;
        victims.extend(rows.iter().take(excess).map(|r| r.url.clone()));
    }

    let mut total: u64 = rows.iter().map(|r| r.size).sum();
    if total > limits.max_bytes {
        for row in rows {
            if total <= limits.target_bytes {
                break;
            }
            total = total.saturating_sub(row.size);
            report.over_bytes += 1;
            victims.insert(row.url.clone());
        }
    }

    (victims, report)
}

impl CacheDb {
    /// Get an image by URL.
    pub async fn get_image(&self, url: &str) -> Result<Option<ImageRecord>, Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<Option<ImageRecord>, Error> {
                let record = conn
                    .query_row(
                        "SELECT url, blob, size, content_type, cached_at, last_accessed
                         FROM images WHERE url = ?1",
                        params![url],
                        |row| {
                            Ok(ImageRecord {
                                url: row.get(0)?,
                                blob: row.get(1)?,
                                size: row.get::<_, i64>(2)? as u64,
                                content_type: row.get(3)?,
                                cached_at: from_millis(row.get(4)?),
                                last_accessed: from_millis(row.get(5)?),
                            })
                        },
                    )
                    .optional()?;
                Ok(record)
            })
            .await
            .map_err(Error::from)
    }

    /// Insert or replace an image.
    pub async fn put_image(&self, record: &ImageRecord) -> Result<(), Error> {
        let record = record.clone();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute(
                    "INSERT INTO images (url, blob, size, content_type, cached_at, last_accessed)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(url) DO UPDATE SET
                        blob = excluded.blob,
                        size = excluded.size,
                        content_type = excluded.content_type,
                        cached_at = excluded.cached_at,
                        last_accessed = excluded.last_accessed",
                    params![
                        &record.url,
                        &record.blob,
                        record.size as i64,
                        &record.content_type,
                        to_millis(record.cached_at),
                        to_millis(record.last_accessed),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Bump `last_accessed` for an image.
    pub async fn touch_image(&self, url: &str, at: DateTime<Utc>) -> Result<(), Error> {
        let url = url.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("UPDATE images SET last_accessed = ?2 WHERE url = ?1", params![url, to_millis(at)])?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Delete a batch of images in one transaction.
    ///
    /// Returns the number of deleted entries.
    pub async fn delete_images(&self, urls: Vec<String>) -> Result<u64, Error> {
        if urls.is_empty() {
            return Ok(0);
        }
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let tx = conn.transaction()?;
                let mut deleted = 0u64;
                {
                    let mut stmt = tx.prepare("DELETE FROM images WHERE url = ?1")?;
                    for url in &urls {
                        deleted += stmt.execute(params![url])? as u64;
                    }
                }
                tx.commit()?;
                Ok(deleted)
            })
            .await
            .map_err(Error::from)
    }

    /// Walk every image oldest-accessed first, without blobs.
    pub async fn scan_images(&self) -> Result<Vec<ImageScanRow>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<ImageScanRow>, Error> {
                let mut stmt = conn.prepare(
                    "SELECT url, size, cached_at, last_accessed FROM images
                     INDEXED BY idx_images_last_accessed
                     ORDER BY last_accessed ASC, url ASC",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(ImageScanRow {
                            url: row.get(0)?,
                            size: row.get::<_, i64>(1)? as u64,
                            cached_at: from_millis(row.get(2)?),
                            last_accessed: from_millis(row.get(3)?),
                        })
                    })?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await
            .map_err(Error::from)
    }

    /// Count and total size of stored images.
    pub async fn image_stats(&self) -> Result<ImageStats, Error> {
        self.conn
            .call(|conn| -> Result<ImageStats, Error> {
                let stats = conn.query_row("SELECT COUNT(*), COALESCE(SUM(size), 0) FROM images", [], |row| {
                    Ok(ImageStats { count: row.get::<_, i64>(0)? as u64, total_bytes: row.get::<_, i64>(1)? as u64 })
                })?;
                Ok(stats)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every stored image.
    ///
    /// Returns the number of deleted entries.
    pub async fn clear_images(&self) -> Result<u64, Error> {
        self.conn
            .call(|conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM images", [])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }

    /// Maintenance pass: enforce the entry and byte ceilings.
    ///
    /// Over `max_entries`, the oldest-accessed entries go until the count fits.
    /// Over `max_bytes`, the oldest-accessed entries go until the total is at
    /// most `target_bytes`. Both sets are deleted in one batch.
    pub async fn prune_images(&self, limits: PruneLimits) -> Result<PruneReport, Error> {
        let rows = self.scan_images().await?;
        let (victims, mut report) = plan_prune(&rows, limits);
        report.deleted = self.delete_images(victims.into_iter().collect()).await?;

        if report.deleted > 0 {
            tracing::info!(
                deleted = report.deleted,
                over_count = report.over_count,
                over_bytes = report.over_bytes,
                "pruned image store"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_at(url: &str, size: usize, accessed_ms: i64) -> ImageRecord {
        ImageRecord {
            url: url.to_string(),
            blob: vec![0u8; size],
            size: size as u64,
            content_type: Some("image/png".into()),
            cached_at: from_millis(accessed_ms),
            last_accessed: from_millis(accessed_ms),
        }
    }

    fn row(url: &str, size: u64, accessed_ms: i64) -> ImageScanRow {
        ImageScanRow {
            url: url.into(),
            size,
            cached_at: from_millis(accessed_ms),
            last_accessed: from_millis(accessed_ms),
        }
    }

    #[tokio::test]
    async fn test_put_get_touch() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let record = record_at("https://img.example/a.png", 10, 1_000);
        db.put_image(&record).await.unwrap();

        let got = db.get_image(&record.url).await.unwrap().unwrap();
        assert_eq!(got, record);

        db.touch_image(&record.url, from_millis(5_000)).await.unwrap();
        let got = db.get_image(&record.url).await.unwrap().unwrap();
        assert_eq!(got.last_accessed, from_millis(5_000));
        assert_eq!(got.cached_at, from_millis(1_000));
    }

    #[tokio::test]
    async fn test_scan_orders_by_last_accessed() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_image(&record_at("c", 1, 300)).await.unwrap();
        db.put_image(&record_at("a", 1, 100)).await.unwrap();
        db.put_image(&record_at("b", 1, 200)).await.unwrap();

        let urls: Vec<_> = db.scan_images().await.unwrap().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_plan_prune_by_count() {
        let rows: Vec<_> = (0..5).map(|i| row(&format!("u{i}"), 1, i)).collect();
        let limits = PruneLimits { max_entries: 3, max_bytes: 1_000, target_bytes: 800 };
        let (victims, report) = plan_prune(&rows, limits);
        assert_eq!(victims.into_iter().collect::<Vec<_>>(), vec!["u0", "u1"]);
        assert_eq!(report.over_count, 2);
        assert_eq!(report.over_bytes, 0);
    }

    #[test]
    fn test_plan_prune_by_bytes_down_to_target() {
        let rows: Vec<_> = (0..5).map(|i| row(&format!("u{i}"), 30, i)).collect();
        // 150 bytes stored, ceiling 100, target 80: drop three oldest (150 -> 60).
        let limits = PruneLimits { max_entries: 200, max_bytes: 100, target_bytes: 80 };
        let (victims, report) = plan_prune(&rows, limits);
        assert_eq!(victims.len(), 3);
        assert!(victims.contains("u0") && victims.contains("u1") && victims.contains("u2"));
        assert_eq!(report.over_bytes, 3);
    }

    #[test]
    fn test_plan_prune_unions_both_sets() {
        let mut rows: Vec<_> = (0..4).map(|i| row(&format!("u{i}"), 10, i)).collect();
        rows.push(row("big", 100, 10));
        let limits = PruneLimits { max_entries: 3, max_bytes: 100, target_bytes: 80 };
        let (victims, report) = plan_prune(&rows, limits);
        // count excess: u0, u1; byte excess (140 -> <=80): u0..u3 then 100 left, so "big" too.
        assert_eq!(report.over_count, 2);
        assert_eq!(victims.len(), 5);
    }

    #[test]
    fn test_plan_prune_within_limits() {
        let rows: Vec<_> = (0..3).map(|i| row(&format!("u{i}"), 10, i)).collect();
        let limits = PruneLimits { max_entries: 3, max_bytes: 30, target_bytes: 24 };
        let (victims, _) = plan_prune(&rows, limits);
        assert!(victims.is_empty());
    }

    #[tokio::test]
    async fn test_prune_images_batched_delete() {
        let db = CacheDb::open_in_memory().await.unwrap();
        for i in 0..6 {
            db.put_image(&record_at(&format!("u{i}"), 10, i)).await.unwrap();
        }

        let limits = PruneLimits { max_entries: 4, max_bytes: 1_000, target_bytes: 800 };
        let report = db.prune_images(limits).await.unwrap();

        assert_eq!(report.deleted, 2);
        assert!(db.get_image("u0").await.unwrap().is_none());
        assert!(db.get_image("u1").await.unwrap().is_none());
        assert_eq!(db.image_stats().await.unwrap(), ImageStats { count: 4, total_bytes: 40 });
    }

    #[tokio::test]
    async fn test_clear_images() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.put_image(&record_at("a", 5, 1)).await.unwrap();
        db.put_image(&record_at("b", 5, 2)).await.unwrap();
        assert_eq!(db.clear_images().await.unwrap(), 2);
        assert_eq!(db.image_stats().await.unwrap(), ImageStats::default());
    }
}
