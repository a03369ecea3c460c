use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a queued write originally came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteContext {
  pub method: String,
  pub url: String,
}

/// A state-changing request that has not been acknowledged by the server yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
  /// Monotonic, assigned by the store
  pub id: i64,
  /// The original request body, replayed verbatim
  pub payload: serde_json::Value,
  pub context: Option<WriteContext>,
  pub created_at: DateTime<Utc>,
  /// Failed replay attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// A pending write that exhausted its replay attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub write: PendingWrite,
  pub dead_lettered_at: DateTime<Utc>,
}

/// Latest snapshot for a logical key, e.g. "dashboard_stats".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedKeyedRecord {
  pub key: String,
  pub data: serde_json::Value,
  /// Epoch milliseconds
  pub timestamp: i64,
}

impl CachedKeyedRecord {
  pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
    chrono::Duration::milliseconds(now.timestamp_millis() - self.timestamp)
  }
}
