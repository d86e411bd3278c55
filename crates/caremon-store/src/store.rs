//! Main store implementation.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use caremon_types::QueuedRequest;

use crate::error::{Error, Result};
use crate::schema;

/// Key the request queue is persisted under.
pub const QUEUE_KEY: &str = "caremon:request_queue";

/// Lifetime of a cache entry when the caller has no better idea.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// SQLite-backed store for the offline queue and response cache.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    // === Key/value ===

    fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
            .transpose()
    }

    fn put_value<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, raw, now_millis()],
        )?;
        Ok(())
    }

    // === Request queue ===

    /// Load the persisted queue in FIFO order.
    ///
    /// A missing queue is empty. A queue that no longer parses is logged
    /// and treated as empty so one bad write cannot wedge delivery forever.
    pub fn load_queue(&self) -> Result<Vec<QueuedRequest>> {
        match self.get_value::<Vec<QueuedRequest>>(QUEUE_KEY) {
            Ok(queue) => Ok(queue.unwrap_or_default()),
            Err(Error::Serialization(e)) => {
                warn!(error = %e, "Persisted request queue is unreadable, starting empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Replace the persisted queue wholesale.
    pub fn save_queue(&self, queue: &[QueuedRequest]) -> Result<()> {
        self.put_value(QUEUE_KEY, queue)?;
        debug!(len = queue.len(), "Persisted request queue");
        Ok(())
    }

    /// Append one request to the tail of the queue. Returns the new length.
    pub fn append_request(&self, request: &QueuedRequest) -> Result<usize> {
        let mut queue = self.load_queue()?;
        queue.push(request.clone());
        self.save_queue(&queue)?;
        Ok(queue.len())
    }

    /// Remove a request by id. Returns whether it was present.
    pub fn remove_request(&self, id: &str) -> Result<bool> {
        let mut queue = self.load_queue()?;
        let before = queue.len();
        queue.retain(|r| r.id() != id);
        if queue.len() == before {
            return Ok(false);
        }
        self.save_queue(&queue)?;
        Ok(true)
    }

    /// Drop every queued request. Returns how many were removed.
    pub fn clear_queue(&self) -> Result<usize> {
        let removed = self.load_queue()?.len();
        self.conn.execute("DELETE FROM kv WHERE key = ?", [QUEUE_KEY])?;
        Ok(removed)
    }

    // === Response cache ===

    /// Cache `value` under `key` for `ttl`.
    pub fn cache_put<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        let now = now_millis();
        let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        self.conn.execute(
            "INSERT INTO cache (key, value, stored_at, expires_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET value = ?2, stored_at = ?3, expires_at = ?4",
            rusqlite::params![key, raw, now, now.saturating_add(ttl_millis)],
        )?;
        Ok(())
    }

    /// Read a cached value. Expired entries are evicted and reported as absent.
    pub fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT value, expires_at FROM cache WHERE key = ?",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((raw, expires_at)) = row else {
            return Ok(None);
        };
        if expires_at <= now_millis() {
            self.conn.execute("DELETE FROM cache WHERE key = ?", [key])?;
            debug!(key, "Evicted expired cache entry");
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// Delete every expired cache entry. Returns how many were removed.
    pub fn clear_expired_cache(&self) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM cache WHERE expires_at <= ?", [now_millis()])?;
        if removed > 0 {
            debug!(removed, "Cleared expired cache entries");
        }
        Ok(removed)
    }

    /// Delete the whole cache. Returns how many entries were removed.
    pub fn clear_cache(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM cache", [])?)
    }
}

fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caremon_types::HttpMethod;
    use serde_json::json;

    fn request(n: u32) -> QueuedRequest {
        QueuedRequest::new(
            HttpMethod::Post,
            "https://ingest.example.com/v1/telemetry",
            Some(json!({ "n": n })),
        )
    }

    #[test]
    fn test_empty_queue() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_queue().unwrap().is_empty());
        assert_eq!(store.clear_queue().unwrap(), 0);
    }

    #[test]
    fn test_append_preserves_fifo_order() {
        let store = Store::open_in_memory().unwrap();
        let requests: Vec<_> = (0..3).map(request).collect();
        for (i, r) in requests.iter().enumerate() {
            assert_eq!(store.append_request(r).unwrap(), i + 1);
        }

        let loaded = store.load_queue().unwrap();
        assert_eq!(loaded, requests);
    }

    #[test]
    fn test_save_queue_replaces_wholesale() {
        let store = Store::open_in_memory().unwrap();
        store.append_request(&request(0)).unwrap();
        store.append_request(&request(1)).unwrap();

        let mut retried = request(2);
        retried.record_retry();
        store.save_queue(std::slice::from_ref(&retried)).unwrap();

        let loaded = store.load_queue().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id(), retried.id());
        assert_eq!(loaded[0].retry_count(), 1);
    }

    #[test]
    fn test_remove_request() {
        let store = Store::open_in_memory().unwrap();
        let a = request(0);
        let b = request(1);
        store.append_request(&a).unwrap();
        store.append_request(&b).unwrap();

        assert!(store.remove_request(a.id()).unwrap());
        assert!(!store.remove_request(a.id()).unwrap());
        assert_eq!(store.load_queue().unwrap(), vec![b]);
    }

    #[test]
    fn test_clear_queue() {
        let store = Store::open_in_memory().unwrap();
        store.append_request(&request(0)).unwrap();
        store.append_request(&request(1)).unwrap();
        assert_eq!(store.clear_queue().unwrap(), 2);
        assert!(store.load_queue().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_queue_loads_empty() {
        let store = Store::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, 'not json', 0)",
                [QUEUE_KEY],
            )
            .unwrap();
        assert!(store.load_queue().unwrap().is_empty());
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("agent.db");
        let r = request(7);

        {
            let store = Store::open(&path).unwrap();
            store.append_request(&r).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.load_queue().unwrap(), vec![r]);
    }

    #[test]
    fn test_cache_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store
            .cache_put("ward:42", &json!({ "device": "AA:BB" }), DEFAULT_CACHE_TTL)
            .unwrap();

        let value: Option<serde_json::Value> = store.cache_get("ward:42").unwrap();
        assert_eq!(value, Some(json!({ "device": "AA:BB" })));

        let missing: Option<serde_json::Value> = store.cache_get("ward:43").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_expired_cache_entry_is_evicted_on_read() {
        let store = Store::open_in_memory().unwrap();
        store.cache_put("stale", "value", Duration::ZERO).unwrap();

        let value: Option<String> = store.cache_get("stale").unwrap();
        assert!(value.is_none());

        let remaining: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_clear_expired_cache_keeps_live_entries() {
        let store = Store::open_in_memory().unwrap();
        store.cache_put("stale", &1, Duration::ZERO).unwrap();
        store.cache_put("live", &2, DEFAULT_CACHE_TTL).unwrap();

        assert_eq!(store.clear_expired_cache().unwrap(), 1);
        assert_eq!(store.cache_get::<i32>("live").unwrap(), Some(2));

        assert_eq!(store.clear_cache().unwrap(), 1);
        assert_eq!(store.cache_get::<i32>("live").unwrap(), None);
    }

    #[test]
    fn test_cache_put_overwrites() {
        let store = Store::open_in_memory().unwrap();
        store.cache_put("k", &1, DEFAULT_CACHE_TTL).unwrap();
        store.cache_put("k", &2, DEFAULT_CACHE_TTL).unwrap();
        assert_eq!(store.cache_get::<i32>("k").unwrap(), Some(2));
    }
}
