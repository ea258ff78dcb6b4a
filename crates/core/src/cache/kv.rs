//! Durable string key/value store.
//!
//! The local block and page-info caches persist through [`KvStore`]. The
//! SQLite implementation enforces a byte quota so that a full store behaves
//! like a browser storage quota: the write is refused with
//! [`Error::QuotaExceeded`] and nothing changes.

use async_trait::async_trait;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite::OptionalExtension;

use super::connection::CacheDb;
use crate::Error;

/// String key/value persistence with enumerable keys.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    /// Insert or replace `key`. May fail with [`Error::QuotaExceeded`].
    async fn set(&self, key: &str, value: &str) -> Result<(), Error>;

    async fn remove(&self, key: &str) -> Result<(), Error>;

    async fn keys(&self) -> Result<Vec<String>, Error>;
}

#[async_trait]
impl KvStore for CacheDb {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<Option<String>, Error> {
                let value = conn
                    .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()?;
                Ok(value)
            })
            .await
            .map_err(Error::from)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        let key = key.to_string();
        let value = value.to_string();
        let quota = self.kv_quota;
        let now = chrono::Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                let used: i64 = conn.query_row(
                    "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
                     FROM kv WHERE key != ?1",
                    params![key],
                    |row| row.get(0),
                )?;
                let needed = used as usize + key.len() + value.len();
                if needed > quota {
                    return Err(Error::QuotaExceeded { needed, quota });
                }

                conn.execute(
                    "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET
                        value = excluded.value,
                        updated_at = excluded.updated_at",
                    params![key, value, now],
                )?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn remove(&self, key: &str) -> Result<(), Error> {
        let key = key.to_string();
        self.conn
            .call(move |conn| -> Result<(), Error> {
                conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    async fn keys(&self) -> Result<Vec<String>, Error> {
        self.conn
            .call(|conn| -> Result<Vec<String>, Error> {
                let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
                let keys = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok(keys)
            })
            .await
            .map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_remove() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.set("a", "1").await.unwrap();
        assert_eq!(db.get("a").await.unwrap().as_deref(), Some("1"));

        db.set("a", "2").await.unwrap();
        assert_eq!(db.get("a").await.unwrap().as_deref(), Some("2"));

        db.remove("a").await.unwrap();
        assert!(db.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_enumerates() {
        let db = CacheDb::open_in_memory().await.unwrap();
        db.set("b", "x").await.unwrap();
        db.set("a", "y").await.unwrap();
        assert_eq!(db.keys().await.unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_quota_refuses_write() {
        let db = CacheDb::open_in_memory().await.unwrap().with_kv_quota(16);
        db.set("k1", "12345").await.unwrap();

        let err = db.set("k2", "0123456789").await.unwrap_err();
        assert!(err.is_quota());
        assert!(db.get("k2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_counts_replacement_once() {
        let db = CacheDb::open_in_memory().await.unwrap().with_kv_quota(12);
        db.set("k", "0123456789").await.unwrap();
        db.set("k", "9876543210").await.unwrap();
        assert_eq!(db.get("k").await.unwrap().as_deref(), Some("9876543210"));
    }
}
