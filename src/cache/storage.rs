//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::db;
use crate::net::{Response, ResponseType};

/// A response stored in a named cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for named-cache storage backends.
///
/// Each cache is keyed by name (the version tag) and maps request URLs to
/// responses.
pub trait CacheStorage: Send + Sync {
  /// Names of all existing caches.
  fn cache_names(&self) -> Result<Vec<String>>;

  /// Whether a cache with this name exists.
  fn has_cache(&self, name: &str) -> Result<bool>;

  /// Store a batch of entries atomically, creating the cache if absent.
  fn put_all(&self, name: &str, entries: &[(String, Response)]) -> Result<()>;

  /// Store a single entry in an existing cache. Fails if the cache is absent.
  fn put(&self, name: &str, url: &str, response: &Response) -> Result<()>;

  /// Look up an entry by exact URL.
  fn match_url(&self, name: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// URLs stored in a cache, in insertion order.
  fn urls(&self, name: &str) -> Result<Vec<String>>;

  /// Delete a cache and all its entries. Returns false if it did not exist.
  fn delete_cache(&self, name: &str) -> Result<bool>;

  /// Record that a cache became the live generation.
  fn mark_active(&self, name: &str) -> Result<()>;

  /// Whether a cache has been activated.
  fn is_active(&self, name: &str) -> Result<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

impl SqliteCacheStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open(path, CACHE_SCHEMA)?),
    })
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    Ok(Self {
      conn: Mutex::new(db::open_in_memory(CACHE_SCHEMA)?),
    })
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS caches (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    activated_at TEXT
);

CREATE TABLE IF NOT EXISTS cache_entries (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    final_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    body_sha256 TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (cache_name, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_name ON cache_entries(cache_name);
"#;

fn body_digest(body: &[u8]) -> String {
  hex::encode(Sha256::digest(body))
}

fn cache_exists(conn: &Connection, name: &str) -> Result<bool> {
  let found: Option<i64> = conn
    .query_row(
      "SELECT 1 FROM caches WHERE name = ?",
      params![name],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

  Ok(found.is_some())
}

fn ensure_cache(tx: &Transaction<'_>, name: &str) -> Result<()> {
  tx.execute(
    "INSERT OR IGNORE INTO caches (name) VALUES (?)",
    params![name],
  )
  .map_err(|e| eyre!("Failed to create cache {}: {}", name, e))?;
  Ok(())
}

fn insert_entry(tx: &Transaction<'_>, name: &str, url: &str, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  tx.execute(
    "INSERT OR REPLACE INTO cache_entries
       (cache_name, url, final_url, status, response_type, headers, body, body_sha256, cached_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))",
    params![
      name,
      url,
      response.url,
      response.status,
      response.response_type.as_str(),
      headers,
      response.body,
      body_digest(&response.body),
    ],
  )
  .map_err(|e| eyre!("Failed to store {} in cache {}: {}", url, name, e))?;

  Ok(())
}

impl CacheStorage for SqliteCacheStorage {
  fn cache_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM caches ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn has_cache(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    cache_exists(&conn, name)
  }

  fn put_all(&self, name: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_cache(&tx, name)?;
    for (url, response) in entries {
      insert_entry(&tx, name, url, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn put(&self, name: &str, url: &str, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    // Only install creates caches
    if !cache_exists(&tx, name)? {
      return Err(eyre!("Cache {} does not exist", name));
    }
    insert_entry(&tx, name, url, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn match_url(&self, name: &str, url: &str) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row = conn
      .query_row(
        "SELECT final_url, status, response_type, headers, body, body_sha256, cached_at
         FROM cache_entries WHERE cache_name = ? AND url = ?",
        params![name, url],
        |row| {
          Ok((
            row.get::<_, String>(0)?,
            row.get::<_, u16>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, Vec<u8>>(4)?,
            row.get::<_, String>(5)?,
            row.get::<_, String>(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {} in cache {}: {}", url, name, e))?;

    let Some((final_url, status, response_type, headers, body, digest, cached_at)) = row else {
      return Ok(None);
    };

    if body_digest(&body) != digest {
      warn!(cache = name, url, "Cached body does not match its digest, ignoring entry");
      return Ok(None);
    }

    let response_type = ResponseType::parse(&response_type)
      .ok_or_else(|| eyre!("Unknown response type '{}' for {}", response_type, url))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

    Ok(Some(CachedResponse {
      response: Response {
        url: final_url,
        status,
        response_type,
        headers,
        body,
      },
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn urls(&self, name: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT url FROM cache_entries WHERE cache_name = ? ORDER BY rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let urls = stmt
      .query_map(params![name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of {}: {}", name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry url: {}", e))?;

    Ok(urls)
  }

  fn delete_cache(&self, name: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE cache_name = ?",
      params![name],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", name, e))?;

    let removed = tx
      .execute("DELETE FROM caches WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn mark_active(&self, name: &str) -> Result<()> {
    let conn = self.lock()?;
    let updated = conn
      .execute(
        "UPDATE caches SET activated_at = datetime('now') WHERE name = ?",
        params![name],
      )
      .map_err(|e| eyre!("Failed to activate cache {}: {}", name, e))?;

    if updated == 0 {
      return Err(eyre!("Cache {} does not exist", name));
    }
    Ok(())
  }

  fn is_active(&self, name: &str) -> Result<bool> {
    let conn = self.lock()?;
    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM caches WHERE name = ? AND activated_at IS NOT NULL",
        params![name],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up cache {}: {}", name, e))?;

    Ok(found.is_some())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
