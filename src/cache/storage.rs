//! Bucket storage trait with SQLite and in-memory implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use url::Url;

use super::traits::{CachedResponse, RequestKey};
use crate::http::{Headers, Method};

/// Trait for named-bucket storage backends.
///
/// Every call is individually atomic. Bucket names are reported in creation
/// order.
#[async_trait]
pub trait CacheStorage: Send + Sync {
  /// Create the bucket if it does not exist yet.
  async fn open(&self, bucket: &str) -> Result<()>;

  async fn has(&self, bucket: &str) -> Result<bool>;

  /// Names of all buckets, oldest first.
  async fn keys(&self) -> Result<Vec<String>>;

  /// Delete a bucket and everything in it. Returns whether it existed.
  async fn delete(&self, bucket: &str) -> Result<bool>;

  /// Store one entry, replacing any previous entry for the same key.
  async fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()>;

  /// Store a batch of entries; either all of them land or none do.
  async fn put_all(&self, bucket: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()>;

  async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Keys stored in a bucket, in insertion order.
  async fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>>;

  /// Look a key up in every bucket, oldest bucket first.
  async fn match_any(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    for bucket in self.keys().await? {
      if let Some(found) = self.get(&bucket, key).await? {
        return Ok(Some(found));
      }
    }
    Ok(None)
  }
}

// ============================================================================
// In-memory storage
// ============================================================================

#[derive(Default)]
struct MemoryState {
  order: Vec<String>,
  buckets: HashMap<String, Vec<(RequestKey, CachedResponse)>>,
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    self.state.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn upsert(
  entries: &mut Vec<(RequestKey, CachedResponse)>,
  key: &RequestKey,
  response: &CachedResponse,
) {
  match entries.iter_mut().find(|(k, _)| k == key) {
    Some(existing) => existing.1 = response.clone(),
    None => entries.push((key.clone(), response.clone())),
  }
}

#[async_trait]
impl CacheStorage for MemoryStorage {
  async fn open(&self, bucket: &str) -> Result<()> {
    let mut state = self.lock()?;
    if !state.buckets.contains_key(bucket) {
      state.order.push(bucket.to_string());
      state.buckets.insert(bucket.to_string(), Vec::new());
    }
    Ok(())
  }

  async fn has(&self, bucket: &str) -> Result<bool> {
    Ok(self.lock()?.buckets.contains_key(bucket))
  }

  async fn keys(&self) -> Result<Vec<String>> {
    Ok(self.lock()?.order.clone())
  }

  async fn delete(&self, bucket: &str) -> Result<bool> {
    let mut state = self.lock()?;
    state.order.retain(|name| name != bucket);
    Ok(state.buckets.remove(bucket).is_some())
  }

  async fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let mut state = self.lock()?;
    let entries = state
      .buckets
      .get_mut(bucket)
      .ok_or_else(|| eyre!("Cache bucket not found: {}", bucket))?;
    upsert(entries, key, response);
    Ok(())
  }

  async fn put_all(&self, bucket: &str, batch: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut state = self.lock()?;
    let entries = state
      .buckets
      .get_mut(bucket)
      .ok_or_else(|| eyre!("Cache bucket not found: {}", bucket))?;
    for (key, response) in batch {
      upsert(entries, key, response);
    }
    Ok(())
  }

  async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let state = self.lock()?;
    Ok(
      state
        .buckets
        .get(bucket)
        .and_then(|entries| entries.iter().find(|(k, _)| k == key))
        .map(|(_, response)| response.clone()),
    )
  }

  async fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let state = self.lock()?;
    Ok(
      state
        .buckets
        .get(bucket)
        .map(|entries| entries.iter().map(|(k, _)| k.clone()).collect())
        .unwrap_or_default(),
    )
  }
}

// ============================================================================
// SQLite storage
// ============================================================================

/// SQLite-based bucket storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the store at `path`, or at the default location when `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a throwaway database held in memory.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("monitor-sw").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }

  fn open_sync(&self, bucket: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to open cache bucket {}: {}", bucket, e))?;
    Ok(())
  }

  fn has_sync(&self, bucket: &str) -> Result<bool> {
    let found: Option<i64> = self
      .lock()?
      .query_row(
        "SELECT id FROM buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache bucket {}: {}", bucket, e))?;
    Ok(found.is_some())
  }

  fn keys_sync(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_sync(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete cache bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put_all_sync(&self, bucket: &str, batch: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let exists: Option<i64> = tx
      .query_row(
        "SELECT id FROM buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache bucket {}: {}", bucket, e))?;
    if exists.is_none() {
      return Err(eyre!("Cache bucket not found: {}", bucket));
    }

    for (key, response) in batch {
      let headers = serde_json::to_string(&response.headers)
        .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

      tx.execute(
        "INSERT INTO entries
           (bucket, request_hash, method, url, status, status_text, headers, body, response_url, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (bucket, request_hash) DO UPDATE SET
           status = excluded.status,
           status_text = excluded.status_text,
           headers = excluded.headers,
           body = excluded.body,
           response_url = excluded.response_url,
           cached_at = excluded.cached_at",
        params![
          bucket,
          key.cache_hash(),
          key.method.as_str(),
          key.url.as_str(),
          response.status,
          response.status_text,
          headers,
          response.body,
          response.url.as_ref().map(Url::as_str),
          response.cached_at.to_rfc3339(),
        ],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_sync(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<StoredRow> = conn
      .query_row(
        "SELECT status, status_text, headers, body, response_url, cached_at FROM entries
         WHERE bucket = ? AND request_hash = ?",
        params![bucket, key.cache_hash()],
        |row| {
          Ok(StoredRow {
            status: row.get(0)?,
            status_text: row.get(1)?,
            headers: row.get(2)?,
            body: row.get(3)?,
            response_url: row.get(4)?,
            cached_at: row.get(5)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {} from {}: {}", key, bucket, e))?;

    row.map(StoredRow::into_cached).transpose()
  }

  fn entries_sync(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT method, url FROM entries WHERE bucket = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![bucket], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })
      .map_err(|e| eyre!("Failed to list entries of {}: {}", bucket, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read entry of {}: {}", bucket, e))?;

    rows
      .into_iter()
      .map(|(method, url)| {
        let url = Url::parse(&url).map_err(|e| eyre!("Invalid cached URL '{}': {}", url, e))?;
        Ok(RequestKey::new(Method::parse(&method), url))
      })
      .collect()
  }
}

/// Raw row from the entries table.
struct StoredRow {
  status: u16,
  status_text: String,
  headers: String,
  body: Vec<u8>,
  response_url: Option<String>,
  cached_at: String,
}

impl StoredRow {
  fn into_cached(self) -> Result<CachedResponse> {
    let headers: Headers = serde_json::from_str(&self.headers)
      .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
    let url = self
      .response_url
      .map(|u| Url::parse(&u).map_err(|e| eyre!("Invalid cached URL '{}': {}", u, e)))
      .transpose()?;

    Ok(CachedResponse {
      status: self.status,
      status_text: self.status_text,
      headers,
      body: self.body,
      url,
      cached_at: parse_datetime(&self.cached_at)?,
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Named buckets, id preserves creation order
CREATE TABLE IF NOT EXISTS buckets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Response snapshots keyed by request hash
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    response_url TEXT,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (bucket, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);
"#;

#[async_trait]
impl CacheStorage for SqliteStorage {
  async fn open(&self, bucket: &str) -> Result<()> {
    self.open_sync(bucket)
  }

  async fn has(&self, bucket: &str) -> Result<bool> {
    self.has_sync(bucket)
  }

  async fn keys(&self) -> Result<Vec<String>> {
    self.keys_sync()
  }

  async fn delete(&self, bucket: &str) -> Result<bool> {
    self.delete_sync(bucket)
  }

  async fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    self.put_all_sync(bucket, std::slice::from_ref(&(key.clone(), response.clone())))
  }

  async fn put_all(&self, bucket: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    self.put_all_sync(bucket, entries)
  }

  async fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.get_sync(bucket, key)
  }

  async fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    self.entries_sync(bucket)
  }
}

/// Parse an RFC 3339 timestamp as written by `put_all_sync`.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;

  fn key(path: &str) -> RequestKey {
    RequestKey::get(Url::parse("http://localhost:8000/").unwrap().join(path).unwrap())
  }

  fn snapshot(body: &str) -> CachedResponse {
    CachedResponse::from_response(Response::new(200, body.as_bytes().to_vec())).unwrap()
  }

  /// Behaviour every backend must share.
  async fn exercise_backend(storage: &dyn CacheStorage) {
    assert!(storage.keys().await.unwrap().is_empty());

    storage.open("monitor-iot-v1.0.0").await.unwrap();
    storage.open("monitor-iot-v2.0.0").await.unwrap();
    // Re-opening keeps the original position.
    storage.open("monitor-iot-v1.0.0").await.unwrap();
    assert_eq!(
      storage.keys().await.unwrap(),
      vec!["monitor-iot-v1.0.0", "monitor-iot-v2.0.0"]
    );
    assert!(storage.has("monitor-iot-v2.0.0").await.unwrap());
    assert!(!storage.has("monitor-iot-v3.0.0").await.unwrap());

    storage
      .put("monitor-iot-v1.0.0", &key("/app.js"), &snapshot("old"))
      .await
      .unwrap();
    storage
      .put("monitor-iot-v1.0.0", &key("/app.js"), &snapshot("new"))
      .await
      .unwrap();
    let found = storage
      .get("monitor-iot-v1.0.0", &key("/app.js"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(found.body, b"new");
    assert_eq!(storage.entries("monitor-iot-v1.0.0").await.unwrap(), vec![key("/app.js")]);

    // Lookup across buckets finds it regardless of which bucket holds it.
    assert!(storage.match_any(&key("/app.js")).await.unwrap().is_some());
    assert!(storage.match_any(&key("/missing.js")).await.unwrap().is_none());

    // Writes into a bucket that was never opened fail.
    assert!(storage
      .put("unknown", &key("/app.js"), &snapshot("x"))
      .await
      .is_err());

    assert!(storage.delete("monitor-iot-v1.0.0").await.unwrap());
    assert!(!storage.delete("monitor-iot-v1.0.0").await.unwrap());
    assert_eq!(storage.keys().await.unwrap(), vec!["monitor-iot-v2.0.0"]);
    assert!(storage.match_any(&key("/app.js")).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_memory_storage() {
    exercise_backend(&MemoryStorage::new()).await;
  }

  #[tokio::test]
  async fn test_sqlite_storage() {
    exercise_backend(&SqliteStorage::open_in_memory().unwrap()).await;
  }

  #[tokio::test]
  async fn test_sqlite_put_all_into_missing_bucket_writes_nothing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let batch = vec![(key("/"), snapshot("root")), (key("/index.html"), snapshot("index"))];
    assert!(storage.put_all("missing", &batch).await.is_err());
    assert!(storage.entries("missing").await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_sqlite_storage_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let storage = SqliteStorage::open(Some(&path)).unwrap();
      storage.open("monitor-iot-v1.0.0").await.unwrap();
      let mut headers = Headers::new();
      headers.set("content-type", "text/html");
      let response = Response::new(200, b"<html></html>".to_vec())
        .with_headers(headers)
        .with_url(Url::parse("http://localhost:8000/index.html").unwrap());
      storage
        .put(
          "monitor-iot-v1.0.0",
          &key("/index.html"),
          &CachedResponse::from_response(response).unwrap(),
        )
        .await
        .unwrap();
    }

    let storage = SqliteStorage::open(Some(&path)).unwrap();
    let found = storage
      .get("monitor-iot-v1.0.0", &key("/index.html"))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(found.status, 200);
    assert_eq!(found.headers.get("Content-Type"), Some("text/html"));
    assert_eq!(found.body, b"<html></html>");
    assert_eq!(
      found.url.as_ref().map(Url::as_str),
      Some("http://localhost:8000/index.html")
    );
  }
}
