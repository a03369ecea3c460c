//! Durable local store for pending writes and keyed snapshots.
//!
//! Survives restarts. A pending write leaves the queue only through
//! `delete_pending` (after the server acknowledged it) or `dead_letter`.

mod records;

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

pub use records::{CachedKeyedRecord, DeadLetter, PendingWrite, WriteContext};

use crate::cache::parse_millis;
use crate::db::Database;

const PENDING_COLUMNS: &str = "id, payload, context, created_at, attempts, last_error";

/// Raw `pending_writes` row before JSON decoding.
type PendingRow = (i64, String, Option<String>, i64, u32, Option<String>);

pub struct DurableStore {
  conn: Mutex<Connection>,
}

impl DurableStore {
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

  /// Queue a write. The row is committed before this returns.
  pub fn enqueue(
    &self,
    payload: &serde_json::Value,
    context: Option<&WriteContext>,
  ) -> Result<PendingWrite> {
    let conn = self.lock()?;
    let now = Utc::now();

    let payload_json =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
    let context_json = context
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize write context: {}", e))?;

    conn
      .execute(
        "INSERT INTO pending_writes (payload, context, created_at) VALUES (?, ?, ?)",
        params![payload_json, context_json, now.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to queue pending write: {}", e))?;

    let id = conn.last_insert_rowid();
    tracing::debug!(id, "pending write queued");

    Ok(PendingWrite {
      id,
      payload: payload.clone(),
      context: context.cloned(),
      created_at: parse_millis(now.timestamp_millis())?,
      attempts: 0,
      last_error: None,
    })
  }

  /// All queued writes, oldest first.
  pub fn pending_writes(&self) -> Result<Vec<PendingWrite>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {} FROM pending_writes ORDER BY id",
        PENDING_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], read_pending_row)
      .map_err(|e| eyre!("Failed to query pending writes: {}", e))?
      .collect::<rusqlite::Result<Vec<PendingRow>>>()
      .map_err(|e| eyre!("Failed to read pending write: {}", e))?;

    rows.into_iter().map(decode_pending).collect()
  }

  pub fn pending_count(&self) -> Result<usize> {
    let conn = self.lock()?;

    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM pending_writes", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count pending writes: {}", e))?;

    Ok(count as usize)
  }

  /// Remove an acknowledged write. Returns false if it was already gone.
  pub fn delete_pending(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;

    let removed = conn
      .execute("DELETE FROM pending_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete pending write {}: {}", id, e))?;

    Ok(removed > 0)
  }

  pub fn is_pending(&self, id: i64) -> Result<bool> {
    let conn = self.lock()?;

    let found: Option<i64> = conn
      .query_row(
        "SELECT id FROM pending_writes WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to look up pending write {}: {}", id, e))?;

    Ok(found.is_some())
  }

  /// Bump the attempt counter after a failed replay. Returns the new count,
  /// or None if the write is no longer queued.
  pub fn record_failure(&self, id: i64, error: &str) -> Result<Option<u32>> {
    let conn = self.lock()?;

    conn
      .query_row(
        "UPDATE pending_writes SET attempts = attempts + 1, last_error = ?
         WHERE id = ? RETURNING attempts",
        params![error, id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to record failure for {}: {}", id, e))
  }

  /// Move a write out of the queue into the dead-letter table.
  pub fn dead_letter(&self, id: i64) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let copied = tx
      .execute(
        &format!(
          "INSERT INTO dead_letters ({cols}, dead_lettered_at)
           SELECT {cols}, ? FROM pending_writes WHERE id = ?",
          cols = PENDING_COLUMNS
        ),
        params![Utc::now().timestamp_millis(), id],
      )
      .map_err(|e| eyre!("Failed to dead-letter {}: {}", id, e))?;
    tx.execute("DELETE FROM pending_writes WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to dead-letter {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(copied > 0)
  }

  pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!(
        "SELECT {}, dead_lettered_at FROM dead_letters ORDER BY id",
        PENDING_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| Ok((read_pending_row(row)?, row.get::<_, i64>(6)?)))
      .map_err(|e| eyre!("Failed to query dead letters: {}", e))?
      .collect::<rusqlite::Result<Vec<(PendingRow, i64)>>>()
      .map_err(|e| eyre!("Failed to read dead letter: {}", e))?;

    rows
      .into_iter()
      .map(|(row, at)| {
        Ok(DeadLetter {
          write: decode_pending(row)?,
          dead_lettered_at: parse_millis(at)?,
        })
      })
      .collect()
  }

  /// Upsert the snapshot for `key`, stamped with the current time.
  pub fn put_snapshot(&self, key: &str, data: &serde_json::Value) -> Result<CachedKeyedRecord> {
    let conn = self.lock()?;
    let timestamp = Utc::now().timestamp_millis();
    let data_json =
      serde_json::to_string(data).map_err(|e| eyre!("Failed to serialize snapshot: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cached_data (key, data, timestamp) VALUES (?, ?, ?)",
        params![key, data_json, timestamp],
      )
      .map_err(|e| eyre!("Failed to store snapshot {}: {}", key, e))?;

    Ok(CachedKeyedRecord {
      key: key.to_string(),
      data: data.clone(),
      timestamp,
    })
  }

  pub fn snapshot(&self, key: &str) -> Result<Option<CachedKeyedRecord>> {
    let conn = self.lock()?;

    let row: Option<(String, i64)> = conn
      .query_row(
        "SELECT data, timestamp FROM cached_data WHERE key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read snapshot {}: {}", key, e))?;

    match row {
      Some((data, timestamp)) => {
        let data = serde_json::from_str(&data)
          .map_err(|e| eyre!("Failed to deserialize snapshot {}: {}", key, e))?;
        Ok(Some(CachedKeyedRecord {
          key: key.to_string(),
          data,
          timestamp,
        }))
      }
      None => Ok(None),
    }
  }
}

fn read_pending_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PendingRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn decode_pending(row: PendingRow) -> Result<PendingWrite> {
  let (id, payload, context, created_at, attempts, last_error) = row;

  let payload = serde_json::from_str(&payload)
    .map_err(|e| eyre!("Failed to deserialize payload of {}: {}", id, e))?;
  let context = context
    .map(|c| serde_json::from_str(&c))
    .transpose()
    .map_err(|e| eyre!("Failed to deserialize context of {}: {}", id, e))?;

  Ok(PendingWrite {
    id,
    payload,
    context,
    created_at: parse_millis(created_at)?,
    attempts,
    last_error,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn store() -> DurableStore {
    DurableStore::new(Database::open_in_memory().unwrap())
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids() {
    let store = store();
    let a = store.enqueue(&json!({"n": 1}), None).unwrap();
    let b = store.enqueue(&json!({"n": 2}), None).unwrap();

    assert_eq!(a.id, 1);
    assert!(b.id > a.id);
    assert_eq!(store.pending_count().unwrap(), 2);
  }

  #[test]
  fn test_pending_writes_oldest_first() {
    let store = store();
    for n in 0..5 {
      store.enqueue(&json!({"n": n}), None).unwrap();
    }

    let payloads: Vec<_> = store
      .pending_writes()
      .unwrap()
      .into_iter()
      .map(|w| w.payload["n"].as_i64().unwrap())
      .collect();
    assert_eq!(payloads, vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn test_ids_are_not_reused_after_delete() {
    let store = store();
    let a = store.enqueue(&json!({}), None).unwrap();
    assert!(store.delete_pending(a.id).unwrap());
    let b = store.enqueue(&json!({}), None).unwrap();

    assert!(b.id > a.id);
    assert!(!store.delete_pending(a.id).unwrap());
  }

  #[test]
  fn test_context_round_trips() {
    let store = store();
    let ctx = WriteContext {
      method: "POST".into(),
      url: "http://app.local/api/entries".into(),
    };
    store.enqueue(&json!({"amount": 2}), Some(&ctx)).unwrap();

    let writes = store.pending_writes().unwrap();
    assert_eq!(writes[0].context.as_ref(), Some(&ctx));
  }

  #[test]
  fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");

    {
      let store = DurableStore::new(Database::open(&path).unwrap());
      for n in 0..3 {
        store.enqueue(&json!({"n": n}), None).unwrap();
      }
    }

    let reopened = DurableStore::new(Database::open(&path).unwrap());
    let writes = reopened.pending_writes().unwrap();
    assert_eq!(writes.len(), 3);
    let ids: Vec<_> = writes.iter().map(|w| w.id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(writes[2].payload, json!({"n": 2}));
  }

  #[test]
  fn test_record_failure_counts_attempts() {
    let store = store();
    let w = store.enqueue(&json!({}), None).unwrap();

    assert_eq!(store.record_failure(w.id, "HTTP 500").unwrap(), Some(1));
    assert_eq!(store.record_failure(w.id, "timeout").unwrap(), Some(2));

    let stored = &store.pending_writes().unwrap()[0];
    assert_eq!(stored.attempts, 2);
    assert_eq!(stored.last_error.as_deref(), Some("timeout"));
    assert_eq!(store.record_failure(999, "x").unwrap(), None);
    assert!(store.is_pending(w.id).unwrap());
    assert!(!store.is_pending(999).unwrap());
  }

  #[test]
  fn test_dead_letter_moves_row() {
    let store = store();
    let w = store.enqueue(&json!({"bad": true}), None).unwrap();
    store.record_failure(w.id, "HTTP 422").unwrap();

    assert!(store.dead_letter(w.id).unwrap());
    assert_eq!(store.pending_count().unwrap(), 0);

    let dead = store.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].write.id, w.id);
    assert_eq!(dead[0].write.payload, json!({"bad": true}));
    assert_eq!(dead[0].write.attempts, 1);
  }

  #[test]
  fn test_snapshot_upsert_latest_wins() {
    let store = store();
    assert!(store.snapshot("dashboard_stats").unwrap().is_none());

    store.put_snapshot("dashboard_stats", &json!({"v": 1})).unwrap();
    store.put_snapshot("dashboard_stats", &json!({"v": 2})).unwrap();

    let snap = store.snapshot("dashboard_stats").unwrap().unwrap();
    assert_eq!(snap.data, json!({"v": 2}));
  }
}
