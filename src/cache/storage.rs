//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::traits::request_hash;
use crate::net::Response;

/// A single cached request/response pair.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub url: String,
  pub response: Response,
  /// When the entry was last written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named buckets. Writing into a bucket that
/// does not exist creates it.
pub trait CacheStorage: Send + Sync + 'static {
  /// Delete a bucket and every entry in it. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// All bucket names, sorted.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Look up the entry stored for a URL.
  fn get(&self, bucket: &str, url: &Url) -> Result<Option<CachedEntry>>;

  /// Store (or overwrite) the entry for a URL.
  fn put(&self, bucket: &str, url: &Url, response: &Response) -> Result<()>;

  /// Store several entries atomically.
  fn put_all(&self, bucket: &str, entries: &[(Url, Response)]) -> Result<()>;

  fn entry_count(&self, bucket: &str) -> Result<usize>;

  /// Record that the bucket's version took control, creating the bucket if
  /// needed. The record lives until the bucket is deleted.
  fn mark_activated(&self, bucket: &str) -> Result<()>;

  /// Whether the bucket exists and its version was activated.
  fn is_activated(&self, bucket: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Throwaway database, used by tests.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  /// Read a page storage value.
  pub fn get_item(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()?
      .query_row(
        "SELECT value FROM page_storage WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read page storage key {}: {}", key, e))
  }

  /// Write a page storage value.
  pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO page_storage (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write page storage key {}: {}", key, e))?;
    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS buckets (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    -- Set once the bucket's version has been activated
    activated_at TEXT
);

-- One row per (bucket, request URL); headers are a JSON array of pairs
CREATE TABLE IF NOT EXISTS entries (
    bucket TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, request_hash)
);

CREATE INDEX IF NOT EXISTS idx_entries_bucket ON entries(bucket);

-- Durable key/value storage owned by the page
CREATE TABLE IF NOT EXISTS page_storage (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

fn insert_entry(conn: &Connection, bucket: &str, url: &Url, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (bucket, request_hash, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        bucket,
        request_hash(url),
        url.as_str(),
        response.status,
        headers,
        response.body
      ],
    )
    .map_err(|e| eyre!("Failed to store entry for {}: {}", url, e))?;

  Ok(())
}

fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO buckets (name) VALUES (?)",
      params![bucket],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn get(&self, bucket: &str, url: &Url) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let row: Option<(String, u16, String, Vec<u8>, String)> = conn
      .query_row(
        "SELECT url, status, headers, body, cached_at FROM entries
         WHERE bucket = ? AND request_hash = ?",
        params![bucket, request_hash(url)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in {}: {}", url, bucket, e))?;

    match row {
      Some((url, status, headers, body, cached_at)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", url, e))?;
        Ok(Some(CachedEntry {
          url,
          response: Response {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, url: &Url, response: &Response) -> Result<()> {
    let conn = self.conn()?;
    ensure_bucket(&conn, bucket)?;
    insert_entry(&conn, bucket, url, response)
  }

  fn put_all(&self, bucket: &str, entries: &[(Url, Response)]) -> Result<()> {
    let mut conn = self.conn()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_bucket(&tx, bucket)?;
    for (url, response) in entries {
      insert_entry(&tx, bucket, url, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entry_count(&self, bucket: &str) -> Result<usize> {
    let count: i64 = self
      .conn()?
      .query_row(
        "SELECT COUNT(*) FROM entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;
    Ok(count as usize)
  }

  fn mark_activated(&self, bucket: &str) -> Result<()> {
    self
      .conn()?
      .execute(
        "INSERT INTO buckets (name, activated_at) VALUES (?, datetime('now'))
         ON CONFLICT(name) DO UPDATE SET activated_at = COALESCE(activated_at, excluded.activated_at)",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to mark bucket {} activated: {}", bucket, e))?;
    Ok(())
  }

  fn is_activated(&self, bucket: &str) -> Result<bool> {
    let activated: Option<bool> = self
      .conn()?
      .query_row(
        "SELECT activated_at IS NOT NULL FROM buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;
    Ok(activated.unwrap_or(false))
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn url(path: &str) -> Url {
    Url::parse("https://example.org").unwrap().join(path).unwrap()
  }

  #[test]
  fn test_put_creates_bucket_and_overwrites() {
    let storage = SqliteStorage::open_in_memory().unwrap();

    storage
      .put("site-v1", &url("/app.js"), &Response::new(200, "old"))
      .unwrap();
    storage
      .put("site-v1", &url("/app.js"), &Response::new(200, "new"))
      .unwrap();

    assert_eq!(storage.bucket_names().unwrap(), vec!["site-v1".to_string()]);
    assert_eq!(storage.entry_count("site-v1").unwrap(), 1);

    let entry = storage.get("site-v1", &url("/app.js")).unwrap().unwrap();
    assert_eq!(entry.response.body, b"new");
    assert_eq!(entry.url, "https://example.org/app.js");
  }

  #[test]
  fn test_buckets_are_isolated() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("site-v1", &url("/"), &Response::new(200, "one"))
      .unwrap();

    assert!(storage.get("site-v2", &url("/")).unwrap().is_none());
  }

  #[test]
  fn test_delete_bucket() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("site-v1", &url("/"), &Response::new(200, "one"))
      .unwrap();
    storage.put_all("other", &[]).unwrap();

    assert!(storage.delete_bucket("site-v1").unwrap());
    assert!(!storage.delete_bucket("site-v1").unwrap());
    assert_eq!(storage.bucket_names().unwrap(), vec!["other".to_string()]);
    assert_eq!(storage.entry_count("site-v1").unwrap(), 0);
  }

  #[test]
  fn test_headers_survive_storage() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut response = Response::new(200, vec![0u8, 159, 146, 150]);
    response
      .headers
      .push(("content-type".to_string(), "image/png".to_string()));

    storage.put("b", &url("/me.png"), &response).unwrap();

    let entry = storage.get("b", &url("/me.png")).unwrap().unwrap();
    assert_eq!(entry.response, response);
  }

  #[test]
  fn test_page_storage_items() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_item("lastContentUpdate").unwrap(), None);

    storage.set_item("lastContentUpdate", "10").unwrap();
    storage.set_item("lastContentUpdate", "20").unwrap();
    assert_eq!(
      storage.get_item("lastContentUpdate").unwrap().as_deref(),
      Some("20")
    );
  }

  #[test]
  fn test_put_all_creates_bucket_in_one_transaction() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.bucket_names().unwrap().is_empty());

    storage.put_all("site-v1", &[]).unwrap();
    assert_eq!(storage.bucket_names().unwrap(), vec!["site-v1".to_string()]);

    storage
      .put_all(
        "site-v2",
        &[
          (url("/"), Response::new(200, "root")),
          (url("/index.html"), Response::new(200, "index")),
        ],
      )
      .unwrap();
    assert_eq!(storage.entry_count("site-v2").unwrap(), 2);
  }

  #[test]
  fn test_activation_record() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .put("site-v1", &url("/"), &Response::new(200, "one"))
      .unwrap();
    assert!(!storage.is_activated("site-v1").unwrap());
    assert!(!storage.is_activated("missing").unwrap());

    storage.mark_activated("site-v1").unwrap();
    storage.mark_activated("site-v1").unwrap();
    assert!(storage.is_activated("site-v1").unwrap());
    assert_eq!(storage.entry_count("site-v1").unwrap(), 1);

    // Recreating a deleted bucket starts without the record
    storage.delete_bucket("site-v1").unwrap();
    storage
      .put("site-v1", &url("/"), &Response::new(200, "one"))
      .unwrap();
    assert!(!storage.is_activated("site-v1").unwrap());
  }
}
