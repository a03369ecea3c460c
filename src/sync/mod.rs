//! Replays queued writes and refreshes background snapshots.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use url::Url;

use crate::config::Config;
use crate::http::{Network, Request};
use crate::store::{CachedKeyedRecord, DurableStore, PendingWrite};

/// Background sync trigger tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTag {
  /// "sync-entries": drain the pending-writes queue
  FlushPendingWrites,
  /// "update-data": refresh cached snapshots
  RefreshSnapshots,
}

impl SyncTag {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncTag::FlushPendingWrites => "sync-entries",
      SyncTag::RefreshSnapshots => "update-data",
    }
  }

  pub fn parse(tag: &str) -> Option<Self> {
    match tag {
      "sync-entries" => Some(SyncTag::FlushPendingWrites),
      "update-data" => Some(SyncTag::RefreshSnapshots),
      _ => None,
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Outcome of one queue drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Acknowledged and deleted
  pub sent: usize,
  /// Still queued after a failed replay
  pub failed: usize,
  /// Moved to the dead-letter table
  pub dead_lettered: usize,
  /// Being sent by a concurrent drain, or already gone
  pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
  pub write_endpoint: Url,
  pub stats_endpoint: Url,
  pub snapshot_key: String,
  pub max_attempts: Option<u32>,
}

impl SyncSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      write_endpoint: config.server.resolve(&config.sync.write_endpoint)?,
      stats_endpoint: config.server.resolve(&config.sync.stats_endpoint)?,
      snapshot_key: config.sync.snapshot_key.clone(),
      max_attempts: config.sync.max_attempts,
    })
  }
}

pub struct SyncAgent<N: Network> {
  network: Arc<N>,
  store: Arc<DurableStore>,
  settings: SyncSettings,
  /// Ids currently being replayed by some drain
  in_flight: Mutex<HashSet<i64>>,
}

/// Releases an in-flight claim when dropped.
struct Claim<'a> {
  in_flight: &'a Mutex<HashSet<i64>>,
  id: i64,
}

impl Drop for Claim<'_> {
  fn drop(&mut self) {
    if let Ok(mut set) = self.in_flight.lock() {
      set.remove(&self.id);
    }
  }
}

impl<N: Network> SyncAgent<N> {
  pub fn new(network: Arc<N>, store: Arc<DurableStore>, settings: SyncSettings) -> Self {
    Self {
      network,
      store,
      settings,
      in_flight: Mutex::new(HashSet::new()),
    }
  }

  fn claim(&self, id: i64) -> Result<Option<Claim<'_>>> {
    let mut set = self
      .in_flight
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if set.insert(id) {
      Ok(Some(Claim {
        in_flight: &self.in_flight,
        id,
      }))
    } else {
      Ok(None)
    }
  }

  /// Replay every queued write in creation order.
  ///
  /// A record is deleted only after a 2xx answer for it. Failures are logged,
  /// counted against the record, and do not stop the drain.
  pub async fn flush_pending_writes(&self) -> Result<SyncReport> {
    let writes = self.store.pending_writes()?;
    let mut report = SyncReport::default();

    for write in writes {
      let Some(_claim) = self.claim(write.id)? else {
        report.skipped += 1;
        continue;
      };
      // A concurrent drain may have finished it after we listed the queue
      match self.store.is_pending(write.id) {
        Ok(true) => {}
        Ok(false) => {
          report.skipped += 1;
          continue;
        }
        Err(e) => {
          error!(id = write.id, error = %e, "failed to check entry, leaving it queued");
          report.failed += 1;
          continue;
        }
      }

      match self.replay(&write).await {
        Ok(()) => match self.store.delete_pending(write.id) {
          Ok(_) => report.sent += 1,
          Err(e) => {
            // Delivered but still queued; the idempotency key covers the resend
            error!(id = write.id, error = %e, "failed to remove delivered entry");
            report.failed += 1;
          }
        },
        Err(reason) => {
          error!(id = write.id, %reason, "sync failed for entry");
          if self.settle_failure(write.id, &reason) {
            report.dead_lettered += 1;
          } else {
            report.failed += 1;
          }
        }
      }
    }

    if report != SyncReport::default() {
      info!(
        sent = report.sent,
        failed = report.failed,
        dead_lettered = report.dead_lettered,
        skipped = report.skipped,
        "pending writes flushed"
      );
    }
    Ok(report)
  }

  /// Count a failed replay against the record. Returns true when the record
  /// was moved to the dead letters. Storage errors are logged so the drain
  /// can move on to the next record.
  fn settle_failure(&self, id: i64, reason: &str) -> bool {
    let attempts = match self.store.record_failure(id, reason) {
      Ok(attempts) => attempts,
      Err(e) => {
        error!(id, error = %e, "failed to record sync failure");
        return false;
      }
    };

    match (attempts, self.settings.max_attempts) {
      (Some(attempts), Some(max)) if attempts >= max => {
        warn!(id, attempts, "giving up on entry, moving to dead letters");
        match self.store.dead_letter(id) {
          Ok(moved) => moved,
          Err(e) => {
            error!(id, error = %e, "failed to move entry to dead letters");
            false
          }
        }
      }
      _ => false,
    }
  }

  async fn replay(&self, write: &PendingWrite) -> std::result::Result<(), String> {
    let request = Request::post_json(self.settings.write_endpoint.clone(), &write.payload)
      .map_err(|e| e.to_string())?
      .with_header("Idempotency-Key", format!("pending-write-{}", write.id));

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => Ok(()),
      Ok(response) => Err(format!("HTTP {}", response.status)),
      Err(e) => Err(e.to_string()),
    }
  }

  /// Fetch fresh JSON from `endpoint` and upsert it under `key`.
  ///
  /// Returns None, leaving the previous snapshot in place, when the fetch
  /// fails or the body is not JSON.
  pub async fn refresh_snapshot(
    &self,
    key: &str,
    endpoint: &Url,
  ) -> Result<Option<CachedKeyedRecord>> {
    let response = match self.network.fetch(&Request::get(endpoint.clone())).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        error!(%endpoint, status = response.status, "background update failed");
        return Ok(None);
      }
      Err(e) => {
        error!(%endpoint, error = %e, "background update failed");
        return Ok(None);
      }
    };

    let data: serde_json::Value = match serde_json::from_slice(&response.body) {
      Ok(data) => data,
      Err(e) => {
        error!(%endpoint, error = %e, "background update returned invalid JSON");
        return Ok(None);
      }
    };

    let record = self.store.put_snapshot(key, &data)?;
    info!(key, "snapshot refreshed");
    Ok(Some(record))
  }

  /// Refresh the configured stats snapshot.
  pub async fn refresh_snapshots(&self) -> Result<Option<CachedKeyedRecord>> {
    let key = self.settings.snapshot_key.clone();
    let endpoint = self.settings.stats_endpoint.clone();
    self.refresh_snapshot(&key, &endpoint).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::http::mock::{url, MockNetwork};
  use crate::http::{Method, Response};
  use serde_json::json;

  fn settings(max_attempts: Option<u32>) -> SyncSettings {
    SyncSettings {
      write_endpoint: url("/api/entries"),
      stats_endpoint: url("/api/dashboard/stats"),
      snapshot_key: "dashboard_stats".to_string(),
      max_attempts,
    }
  }

  fn agent(max_attempts: Option<u32>) -> (Arc<MockNetwork>, Arc<DurableStore>, SyncAgent<MockNetwork>) {
    let network = Arc::new(MockNetwork::new());
    let store = Arc::new(DurableStore::new(Database::open_in_memory().unwrap()));
    let agent = SyncAgent::new(Arc::clone(&network), Arc::clone(&store), settings(max_attempts));
    (network, store, agent)
  }

  fn payload_names(store: &DurableStore) -> Vec<String> {
    store
      .pending_writes()
      .unwrap()
      .into_iter()
      .map(|w| w.payload["name"].as_str().unwrap().to_string())
      .collect()
  }

  #[test]
  fn test_tag_names() {
    assert_eq!(SyncTag::parse("sync-entries"), Some(SyncTag::FlushPendingWrites));
    assert_eq!(SyncTag::parse("update-data"), Some(SyncTag::RefreshSnapshots));
    assert_eq!(SyncTag::parse("push"), None);
    assert_eq!(SyncTag::RefreshSnapshots.to_string(), "update-data");
  }

  #[tokio::test]
  async fn test_all_succeed_empties_queue() {
    let (network, store, agent) = agent(None);
    network.route(Method::Post, "/api/entries", Response::new(201, "{}"));
    for name in ["a", "b", "c"] {
      store.enqueue(&json!({"name": name}), None).unwrap();
    }

    let report = agent.flush_pending_writes().await.unwrap();

    assert_eq!(report.sent, 3);
    assert_eq!(store.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_replay_is_in_creation_order_with_payload_body() {
    let (network, store, agent) = agent(None);
    network.route(Method::Post, "/api/entries", Response::new(200, "{}"));
    for name in ["first", "second", "third"] {
      store.enqueue(&json!({"name": name}), None).unwrap();
    }

    agent.flush_pending_writes().await.unwrap();

    let sent: Vec<_> = network
      .requests()
      .iter()
      .map(|r| r.json_body().unwrap()["name"].as_str().unwrap().to_string())
      .collect();
    assert_eq!(sent, vec!["first", "second", "third"]);

    let first = &network.requests()[0];
    assert_eq!(first.method, Method::Post);
    assert!(first
      .headers
      .iter()
      .any(|(k, v)| k == "Idempotency-Key" && v == "pending-write-1"));
  }

  #[tokio::test]
  async fn test_all_fail_leaves_queue_unchanged() {
    let (network, store, agent) = agent(None);
    network.set_online(false);
    for name in ["a", "b", "c"] {
      store.enqueue(&json!({"name": name}), None).unwrap();
    }

    let report = agent.flush_pending_writes().await.unwrap();

    assert_eq!(report.failed, 3);
    assert_eq!(report.sent, 0);
    assert_eq!(payload_names(&store), vec!["a", "b", "c"]);
  }

  #[tokio::test]
  async fn test_partial_failure_keeps_only_failed_record() {
    let (network, store, agent) = agent(None);
    network.route(Method::Post, "/api/entries", Response::new(200, "{}"));
    network.reject_if(|req| {
      req
        .json_body()
        .map(|b| b["name"] == "B")
        .unwrap_or(false)
    });
    for name in ["A", "B", "C"] {
      store.enqueue(&json!({"name": name}), None).unwrap();
    }

    let report = agent.flush_pending_writes().await.unwrap();

    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(payload_names(&store), vec!["B"]);
    let remaining = &store.pending_writes().unwrap()[0];
    assert_eq!(remaining.attempts, 1);
    assert_eq!(remaining.last_error.as_deref(), Some("HTTP 500"));
  }

  #[tokio::test]
  async fn test_storage_error_on_one_record_does_not_stop_drain() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agent.db");
    let network = Arc::new(MockNetwork::new());
    let store = Arc::new(DurableStore::new(Database::open(&path).unwrap()));
    let agent = SyncAgent::new(Arc::clone(&network), Arc::clone(&store), settings(None));

    // Record 1 cannot be deleted and record 2 cannot have its failure counted
    rusqlite::Connection::open(&path)
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER pin_first BEFORE DELETE ON pending_writes WHEN OLD.id = 1
           BEGIN SELECT RAISE(ABORT, 'record is pinned'); END;
         CREATE TRIGGER pin_second BEFORE UPDATE ON pending_writes WHEN OLD.id = 2
           BEGIN SELECT RAISE(ABORT, 'record is pinned'); END;",
      )
      .unwrap();

    network.route(Method::Post, "/api/entries", Response::new(201, "{}"));
    network.reject_if(|req| {
      req
        .json_body()
        .map(|b| b["name"] == "B")
        .unwrap_or(false)
    });
    for name in ["A", "B", "C"] {
      store.enqueue(&json!({"name": name}), None).unwrap();
    }

    let report = agent.flush_pending_writes().await.unwrap();

    assert_eq!(report.sent, 1);
    assert_eq!(report.failed, 2);
    assert_eq!(network.calls(), 3);
    assert_eq!(payload_names(&store), vec!["A", "B"]);
  }

  #[tokio::test]
  async fn test_unbounded_retry_never_discards() {
    let (network, store, agent) = agent(None);
    network.set_online(false);
    store.enqueue(&json!({"name": "stuck"}), None).unwrap();

    for _ in 0..10 {
      agent.flush_pending_writes().await.unwrap();
    }

    assert_eq!(store.pending_count().unwrap(), 1);
    assert!(store.dead_letters().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_max_attempts_moves_to_dead_letters() {
    let (network, store, agent) = agent(Some(2));
    network.route(Method::Post, "/api/entries", Response::new(422, "invalid"));
    store.enqueue(&json!({"name": "rejected"}), None).unwrap();

    let first = agent.flush_pending_writes().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(store.pending_count().unwrap(), 1);

    let second = agent.flush_pending_writes().await.unwrap();
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(second.failed, 0);
    assert_eq!(store.pending_count().unwrap(), 0);

    let dead = store.dead_letters().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].write.payload, json!({"name": "rejected"}));
  }

  #[tokio::test]
  async fn test_concurrent_drains_send_each_record_once() {
    let (network, store, agent) = agent(None);
    network.route(Method::Post, "/api/entries", Response::new(200, "{}"));
    for name in ["a", "b", "c", "d"] {
      store.enqueue(&json!({"name": name}), None).unwrap();
    }

    let (r1, r2) = tokio::join!(agent.flush_pending_writes(), agent.flush_pending_writes());
    let (r1, r2) = (r1.unwrap(), r2.unwrap());

    assert_eq!(r1.sent + r2.sent, 4);
    assert_eq!(network.calls(), 4);
    assert_eq!(store.pending_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_claimed_record_is_skipped() {
    let (network, store, agent) = agent(None);
    network.route(Method::Post, "/api/entries", Response::new(200, "{}"));
    let w = store.enqueue(&json!({"name": "busy"}), None).unwrap();

    let claim = agent.claim(w.id).unwrap();
    assert!(claim.is_some());
    let report = agent.flush_pending_writes().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(network.calls(), 0);

    drop(claim);
    let report = agent.flush_pending_writes().await.unwrap();
    assert_eq!(report.sent, 1);
  }

  #[tokio::test]
  async fn test_refresh_snapshot_upserts() {
    let (network, store, agent) = agent(None);
    network.route(
      Method::Get,
      "/api/dashboard/stats",
      Response::json(200, &json!({"income": 120})),
    );

    let record = agent.refresh_snapshots().await.unwrap().unwrap();

    assert_eq!(record.key, "dashboard_stats");
    let stored = store.snapshot("dashboard_stats").unwrap().unwrap();
    assert_eq!(stored.data, json!({"income": 120}));
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_previous_snapshot() {
    let (network, store, agent) = agent(None);
    let previous = store
      .put_snapshot("dashboard_stats", &json!({"income": 100}))
      .unwrap();

    network.set_online(false);
    assert!(agent.refresh_snapshots().await.unwrap().is_none());

    network.set_online(true);
    network.route(Method::Get, "/api/dashboard/stats", Response::new(200, "<html>"));
    assert!(agent.refresh_snapshots().await.unwrap().is_none());

    let stored = store.snapshot("dashboard_stats").unwrap().unwrap();
    assert_eq!(stored, previous);
  }
}
