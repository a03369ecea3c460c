//! Core types for the response cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::{Method, Request, Response};

/// Exact-match identity of a cached request: method plus absolute URL.
///
/// Fragments are dropped, since they never reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: Method,
  pub url: Url,
}

impl RequestKey {
  pub fn new(method: Method, mut url: Url) -> Self {
    url.set_fragment(None);
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method, request.url.clone())
  }

  /// Only reads are ever written to a bucket.
  pub fn is_cacheable(&self) -> bool {
    self.method.is_read()
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
  pub key: RequestKey,
  pub response: Response,
  /// When the snapshot was written
  pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fragment_is_ignored() {
    let a = RequestKey::get(Url::parse("http://app.local/login#top").unwrap());
    let b = RequestKey::get(Url::parse("http://app.local/login").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_method_is_part_of_identity() {
    let url = Url::parse("http://app.local/api/entries").unwrap();
    let get = RequestKey::new(Method::Get, url.clone());
    let post = RequestKey::new(Method::Post, url);
    assert_ne!(get.cache_hash(), post.cache_hash());
    assert!(get.is_cacheable());
    assert!(!post.is_cacheable());
  }

  #[test]
  fn test_query_string_is_part_of_identity() {
    let a = RequestKey::get(Url::parse("http://app.local/products?page=1").unwrap());
    let b = RequestKey::get(Url::parse("http://app.local/products?page=2").unwrap());
    assert_ne!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let key = RequestKey::get(Url::parse("http://app.local/").unwrap());
    let hash = key.cache_hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
