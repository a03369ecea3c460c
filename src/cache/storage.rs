//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;
use url::Url;

use super::traits::{CachedResponse, RequestKey};
use crate::db::Database;
use crate::http::{Response, ResponseType};

/// Trait for cache storage backends.
///
/// Buckets are created implicitly by the first write into them.
pub trait CacheStorage: Send + Sync {
  /// Create an empty bucket if it does not exist yet.
  fn create_bucket(&self, bucket: &str) -> Result<()>;

  /// All bucket names in creation order.
  fn bucket_names(&self) -> Result<Vec<String>>;

  fn has_bucket(&self, bucket: &str) -> Result<bool>;

  /// Delete a bucket and all its entries. Returns false if it did not exist.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  /// Exact-match lookup.
  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;

  /// Store a response, replacing any previous entry for the key.
  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()>;

  /// Store a batch atomically: either every entry lands or none does.
  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()>;

  fn entry_count(&self, bucket: &str) -> Result<usize>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the database is unavailable - the agent runs network-only.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn create_bucket(&self, _bucket: &str) -> Result<()> {
    Ok(())
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn has_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn delete_bucket(&self, _bucket: &str) -> Result<bool> {
    Ok(false)
  }

  fn get(&self, _bucket: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }

  fn put(&self, _bucket: &str, _key: &RequestKey, _response: &Response) -> Result<()> {
    Ok(()) // Discard
  }

  fn put_all(&self, _bucket: &str, _entries: &[(RequestKey, Response)]) -> Result<()> {
    Ok(()) // Discard
  }

  fn entry_count(&self, _bucket: &str) -> Result<usize> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn ensure_bucket(conn: &Connection, bucket: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_buckets (name, created_at) VALUES (?, ?)",
      params![bucket, Utc::now().timestamp_millis()],
    )
    .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (bucket, key_hash, method, url, status, headers, body, response_type, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        bucket,
        key.cache_hash(),
        key.method.as_str(),
        key.url.as_str(),
        response.status,
        headers,
        response.body,
        response.response_type.as_str(),
        Utc::now().timestamp_millis(),
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn create_bucket(&self, bucket: &str) -> Result<()> {
    let conn = self.lock()?;
    ensure_bucket(&conn, bucket)
  }

  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT name FROM cache_buckets ORDER BY created_at, rowid")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn has_bucket(&self, bucket: &str) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT 1 FROM cache_buckets WHERE name = ?",
        params![bucket],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up bucket {}: {}", bucket, e))?;

    Ok(found.is_some())
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE bucket = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = tx
      .execute("DELETE FROM cache_buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn get(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;

    let row: Option<(String, String, u16, String, Vec<u8>, String, i64)> = conn
      .query_row(
        "SELECT method, url, status, headers, body, response_type, stored_at
         FROM cache_entries WHERE bucket = ? AND key_hash = ?",
        params![bucket, key.cache_hash()],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", key, e))?;

    let Some((method, url, status, headers, body, response_type, stored_at)) = row else {
      return Ok(None);
    };

    let method = method
      .parse()
      .map_err(|e| eyre!("Corrupt cache entry for {}: {}", key, e))?;
    let url = Url::parse(&url).map_err(|e| eyre!("Corrupt cache entry for {}: {}", key, e))?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers)
      .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", key, e))?;

    Ok(Some(CachedResponse {
      key: RequestKey::new(method, url),
      response: Response {
        status,
        headers,
        body,
        response_type: ResponseType::from_name(&response_type),
      },
      stored_at: parse_millis(stored_at)?,
    }))
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &Response) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_bucket(&tx, bucket)?;
    insert_entry(&tx, bucket, key, response)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn put_all(&self, bucket: &str, entries: &[(RequestKey, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_bucket(&tx, bucket)?;
    for (key, response) in entries {
      insert_entry(&tx, bucket, key, response)?;
    }

    // Dropping the transaction on an early return rolls it back
    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
    Ok(())
  }

  fn entry_count(&self, bucket: &str) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", bucket, e))?;

    Ok(count as usize)
  }
}

/// Convert an epoch-millisecond column into a timestamp.
pub(crate) fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid timestamp '{}'", ms))
}
