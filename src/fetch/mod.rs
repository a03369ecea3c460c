//! Request interception: classify each request and resolve it network-first or
//! cache-first.
//!
//! Cache reads and writes are advisory. A cache that cannot be read behaves
//! like a miss, and a failed cache write is logged and dropped. Durable-store
//! writes for queued mutations are not advisory and must succeed before the
//! caller is told the write was queued.

use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheManager, CacheStorage, CachedResponse, RequestKey};
use crate::config::Config;
use crate::http::{FetchError, Network, Request, Response};
use crate::store::{DurableStore, PendingWrite, WriteContext};

/// Resolution strategy picked for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  NetworkFirst,
  CacheFirst,
}

/// Where a resolved response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Live response from the server
  Network,
  /// Stored snapshot from the current bucket
  Cache,
  /// The offline page, served for a failed navigation
  OfflineFallback,
  /// The write was saved for later delivery
  Queued { id: i64 },
}

impl ResponseSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseSource::Network => "network",
      ResponseSource::Cache => "cache",
      ResponseSource::OfflineFallback => "offline",
      ResponseSource::Queued { .. } => "queued",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Resolved {
  pub response: Response,
  pub source: ResponseSource,
}

impl Resolved {
  fn network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  fn cached(hit: CachedResponse) -> Self {
    Self {
      response: hit.response,
      source: ResponseSource::Cache,
    }
  }

  fn queued(write: &PendingWrite) -> Self {
    Self {
      response: Response::json(202, &serde_json::json!({ "queued": true, "id": write.id })),
      source: ResponseSource::Queued { id: write.id },
    }
  }
}

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
  /// No network and nothing usable in the cache
  #[error("network unavailable for {url}")]
  NetworkUnavailable {
    url: String,
    #[source]
    cause: FetchError,
  },

  /// The durable store could not record a queued write
  #[error("storage failure: {0:#}")]
  Storage(color_eyre::Report),
}

impl From<color_eyre::Report> for InterceptError {
  fn from(report: color_eyre::Report) -> Self {
    InterceptError::Storage(report)
  }
}

/// Routing knobs for the interceptor.
#[derive(Debug, Clone)]
pub struct InterceptPolicy {
  /// Path prefix that is always network-first
  pub api_prefix: String,
  /// Served for failed navigations when cached
  pub offline_page: Url,
  /// Paths whose failed mutations are queued
  pub queue_paths: Vec<String>,
}

impl InterceptPolicy {
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    Ok(Self {
      api_prefix: config.cache.api_prefix.clone(),
      offline_page: config.server.resolve(&config.cache.offline_page)?,
      queue_paths: config.sync.queue_paths(),
    })
  }
}

pub struct FetchInterceptor<N: Network> {
  network: Arc<N>,
  /// None when the database could not be opened
  store: Option<Arc<DurableStore>>,
  policy: InterceptPolicy,
}

impl<N: Network> FetchInterceptor<N> {
  pub fn new(network: Arc<N>, store: Option<Arc<DurableStore>>, policy: InterceptPolicy) -> Self {
    Self {
      network,
      store,
      policy,
    }
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    if request.url.path().starts_with(&self.policy.api_prefix) || !request.method.is_read() {
      Strategy::NetworkFirst
    } else {
      Strategy::CacheFirst
    }
  }

  /// Resolve one request against `cache`, the bucket of the active generation.
  pub async fn resolve<S: CacheStorage>(
    &self,
    cache: &CacheManager<S>,
    request: &Request,
  ) -> Result<Resolved, InterceptError> {
    let strategy = self.classify(request);
    debug!(method = %request.method, url = %request.url, ?strategy, "intercepted");

    match strategy {
      Strategy::NetworkFirst => self.network_first(cache, request).await,
      Strategy::CacheFirst => self.cache_first(cache, request).await,
    }
  }

  /// Resolve a request while no cache generation exists yet.
  ///
  /// Reads go straight to the network. A failed write is still queued, since
  /// queueing only needs the durable store.
  pub async fn pass_through(&self, request: &Request) -> Result<Resolved, InterceptError> {
    let cause = match self.network.fetch(request).await {
      Ok(response) => return Ok(Resolved::network(response)),
      Err(cause) => cause,
    };

    if let Some(write) = self.queue_if_eligible(request)? {
      return Ok(Resolved::queued(&write));
    }

    Err(InterceptError::NetworkUnavailable {
      url: request.url.to_string(),
      cause,
    })
  }

  async fn network_first<S: CacheStorage>(
    &self,
    cache: &CacheManager<S>,
    request: &Request,
  ) -> Result<Resolved, InterceptError> {
    let key = RequestKey::from_request(request);

    let cause = match self.network.fetch(request).await {
      Ok(response) => {
        if response.status == 200 {
          store_quietly(cache, &key, &response);
        }
        return Ok(Resolved::network(response));
      }
      Err(cause) => cause,
    };

    debug!(%key, error = %cause, "network failed, trying cache");
    if key.is_cacheable() {
      if let Some(hit) = lookup_quietly(cache, &key) {
        return Ok(Resolved::cached(hit));
      }
    }

    if let Some(write) = self.queue_if_eligible(request)? {
      return Ok(Resolved::queued(&write));
    }

    Err(InterceptError::NetworkUnavailable {
      url: request.url.to_string(),
      cause,
    })
  }

  async fn cache_first<S: CacheStorage>(
    &self,
    cache: &CacheManager<S>,
    request: &Request,
  ) -> Result<Resolved, InterceptError> {
    let key = RequestKey::from_request(request);

    if let Some(hit) = lookup_quietly(cache, &key) {
      return Ok(Resolved::cached(hit));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        // Error pages and cross-origin responses pass through uncached
        if response.is_storable() {
          store_quietly(cache, &key, &response);
        }
        Ok(Resolved::network(response))
      }
      Err(cause) => {
        if request.is_navigation() {
          let offline = RequestKey::get(self.policy.offline_page.clone());
          if let Some(page) = lookup_quietly(cache, &offline) {
            return Ok(Resolved {
              response: page.response,
              source: ResponseSource::OfflineFallback,
            });
          }
        }

        Err(InterceptError::NetworkUnavailable {
          url: request.url.to_string(),
          cause,
        })
      }
    }
  }

  /// Queue a failed mutation when its path is configured for queueing and its
  /// body is JSON. The insert completes before this returns.
  fn queue_if_eligible(&self, request: &Request) -> Result<Option<PendingWrite>, InterceptError> {
    if request.method.is_read() {
      return Ok(None);
    }
    let Some(store) = &self.store else {
      return Ok(None);
    };

    let path = request.url.path();
    if !self.policy.queue_paths.iter().any(|p| p == path) {
      return Ok(None);
    }

    let Some(payload) = request.json_body() else {
      warn!(url = %request.url, "not queueing write with non-JSON body");
      return Ok(None);
    };

    let context = WriteContext {
      method: request.method.to_string(),
      url: request.url.to_string(),
    };
    let write = store.enqueue(&payload, Some(&context))?;
    info!(id = write.id, url = %request.url, "offline, write saved for later");

    Ok(Some(write))
  }
}

fn lookup_quietly<S: CacheStorage>(cache: &CacheManager<S>, key: &RequestKey) -> Option<CachedResponse> {
  match cache.lookup(key) {
    Ok(hit) => hit,
    Err(e) => {
      warn!(%key, error = %e, "cache lookup failed, treating as miss");
      None
    }
  }
}

fn store_quietly<S: CacheStorage>(cache: &CacheManager<S>, key: &RequestKey, response: &Response) {
  if let Err(e) = cache.store(key, response) {
    warn!(%key, error = %e, "failed to cache response");
  }
}
