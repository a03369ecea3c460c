//! Owner of one versioned cache bucket.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey};
use crate::http::{Network, Request, Response};

/// Cache manager bound to a single bucket name (e.g. "automaten-manager-v1").
///
/// Several managers may share one storage backend; each only ever writes to
/// its own bucket.
pub struct CacheManager<S: CacheStorage> {
  storage: Arc<S>,
  bucket: String,
}

impl<S: CacheStorage> CacheManager<S> {
  pub fn new(storage: Arc<S>, bucket: impl Into<String>) -> Self {
    Self {
      storage,
      bucket: bucket.into(),
    }
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  /// Fetch every URL and store them all, or store nothing.
  ///
  /// Fetches run concurrently. Any transport failure or any response that is
  /// not a same-origin 200 fails the whole batch before a single write.
  pub async fn warm<N: Network>(&self, network: &N, urls: &[Url]) -> Result<usize> {
    let fetches = urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      let response = network
        .fetch(&request)
        .await
        .map_err(|e| eyre!("Failed to pre-cache {}: {}", url, e))?;

      if !response.is_storable() {
        return Err(eyre!(
          "Failed to pre-cache {}: status {} ({})",
          url,
          response.status,
          response.response_type.as_str()
        ));
      }

      Ok((RequestKey::get(url.clone()), response))
    });

    let entries = try_join_all(fetches).await?;
    if entries.is_empty() {
      // An empty baseline still claims the bucket so the version can be resumed
      self.storage.create_bucket(&self.bucket)?;
    } else {
      self.storage.put_all(&self.bucket, &entries)?;
    }

    info!(bucket = %self.bucket, count = entries.len(), "cache warmed");
    Ok(entries.len())
  }

  /// Exact-match lookup in this bucket. No expiry.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.storage.get(&self.bucket, key)
  }

  /// Store a snapshot, replacing any previous one for the key.
  ///
  /// Returns false without writing when the key is not a GET or the response
  /// is not a same-origin 200.
  pub fn store(&self, key: &RequestKey, response: &Response) -> Result<bool> {
    if !key.is_cacheable() || !response.is_storable() {
      debug!(%key, status = response.status, "not caching");
      return Ok(false);
    }

    self.storage.put(&self.bucket, key, response)?;
    Ok(true)
  }

  /// Delete every bucket except this one. Safe to run repeatedly.
  pub fn evict_stale(&self) -> Result<Vec<String>> {
    let mut evicted = Vec::new();

    for name in self.storage.bucket_names()? {
      if name != self.bucket {
        info!(bucket = %name, "deleting old cache");
        self.storage.delete_bucket(&name)?;
        evicted.push(name);
      }
    }

    Ok(evicted)
  }

  pub fn entry_count(&self) -> Result<usize> {
    self.storage.entry_count(&self.bucket)
  }
}

impl<S: CacheStorage> Clone for CacheManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      bucket: self.bucket.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::db::Database;
  use crate::http::mock::{url, MockNetwork};
  use crate::http::{Method, ResponseType};

  fn storage() -> Arc<SqliteStorage> {
    Arc::new(SqliteStorage::new(Database::open_in_memory().unwrap()))
  }

  #[tokio::test]
  async fn test_warm_stores_every_url() {
    let network = MockNetwork::new();
    network
      .route(Method::Get, "/", Response::new(200, "home"))
      .route(Method::Get, "/login", Response::new(200, "login"));

    let cache = CacheManager::new(storage(), "app-v1");
    let count = cache.warm(&network, &[url("/"), url("/login")]).await.unwrap();

    assert_eq!(count, 2);
    assert_eq!(cache.entry_count().unwrap(), 2);
    let login = cache.lookup(&RequestKey::get(url("/login"))).unwrap().unwrap();
    assert_eq!(login.response.text(), "login");
  }

  #[tokio::test]
  async fn test_warm_is_all_or_nothing() {
    let network = MockNetwork::new();
    network.route(Method::Get, "/", Response::new(200, "home"));
    // "/missing" answers 404

    let cache = CacheManager::new(storage(), "app-v1");
    let result = cache.warm(&network, &[url("/"), url("/missing")]).await;

    assert!(result.is_err());
    assert_eq!(cache.entry_count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_warm_fails_offline() {
    let network = MockNetwork::new();
    network.route(Method::Get, "/", Response::new(200, "home"));
    network.set_online(false);

    let storage = storage();
    let cache = CacheManager::new(Arc::clone(&storage), "app-v1");
    assert!(cache.warm(&network, &[url("/")]).await.is_err());
    assert!(!storage.has_bucket("app-v1").unwrap());
  }

  #[tokio::test]
  async fn test_warm_with_empty_baseline_creates_bucket() {
    let storage = storage();
    let cache = CacheManager::new(Arc::clone(&storage), "app-v1");

    assert_eq!(cache.warm(&MockNetwork::new(), &[]).await.unwrap(), 0);
    assert!(storage.has_bucket("app-v1").unwrap());
  }

  #[test]
  fn test_store_refuses_non_storable() {
    let cache = CacheManager::new(storage(), "app-v1");

    let not_found = Response::new(404, "nope");
    assert!(!cache.store(&RequestKey::get(url("/x")), &not_found).unwrap());

    let opaque = Response::new(200, "").with_type(ResponseType::Opaque);
    assert!(!cache.store(&RequestKey::get(url("/cdn.css")), &opaque).unwrap());

    let post = RequestKey::new(Method::Post, url("/api/entries"));
    assert!(!cache.store(&post, &Response::new(200, "ok")).unwrap());

    assert_eq!(cache.entry_count().unwrap(), 0);
  }

  #[test]
  fn test_evict_stale_keeps_only_current() {
    let storage = storage();
    let v1 = CacheManager::new(Arc::clone(&storage), "app-v1");
    let v2 = CacheManager::new(Arc::clone(&storage), "app-v2");
    v1.store(&RequestKey::get(url("/")), &Response::new(200, "old")).unwrap();
    v2.store(&RequestKey::get(url("/")), &Response::new(200, "new")).unwrap();

    let evicted = v2.evict_stale().unwrap();

    assert_eq!(evicted, vec!["app-v1".to_string()]);
    assert_eq!(storage.bucket_names().unwrap(), vec!["app-v2".to_string()]);

    // Idempotent
    assert!(v2.evict_stale().unwrap().is_empty());
    assert_eq!(storage.bucket_names().unwrap(), vec!["app-v2".to_string()]);
  }
}
