//! Request/response values exchanged with the network, and the `Network` seam.
//!
//! Responses are plain immutable values: the cache and the caller can each hold
//! a copy without any read-once body protocol.

pub mod client;
#[cfg(test)]
pub mod mock;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use url::Url;

/// HTTP method of an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  /// Only GET counts as a read; everything else goes network-first.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl std::str::FromStr for Method {
  type Err = FetchError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(FetchError::InvalidRequest(format!(
        "unsupported method {}",
        other
      ))),
    }
  }
}

/// How the request was issued by the application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// Classification of a response relative to the application's origin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
  /// Same-origin, fully readable
  #[default]
  Basic,
  /// Cross-origin but readable
  Cors,
  /// Cross-origin, status and body hidden
  Opaque,
}

impl ResponseType {
  pub fn as_str(&self) -> &'static str {
    match self {
      ResponseType::Basic => "basic",
      ResponseType::Cors => "cors",
      ResponseType::Opaque => "opaque",
    }
  }

  /// Unknown names are treated as opaque.
  pub fn from_name(name: &str) -> Self {
    match name {
      "basic" => ResponseType::Basic,
      "cors" => ResponseType::Cors,
      _ => ResponseType::Opaque,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A page navigation; eligible for the offline fallback page.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  /// A JSON POST, as used for write replays.
  pub fn post_json(url: Url, payload: &serde_json::Value) -> Result<Self, FetchError> {
    let body = serde_json::to_vec(payload)
      .map_err(|e| FetchError::InvalidRequest(format!("unserializable payload: {}", e)))?;
    Ok(Self {
      headers: vec![("Content-Type".to_string(), "application/json".to_string())],
      body: Some(body),
      ..Self::new(Method::Post, url)
    })
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Parse the request body as JSON, if there is one.
  pub fn json_body(&self) -> Option<serde_json::Value> {
    self
      .body
      .as_deref()
      .and_then(|b| serde_json::from_slice(b).ok())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: Vec<(String, String)>,
  #[serde(default)]
  pub body: Vec<u8>,
  #[serde(default)]
  pub response_type: ResponseType,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      response_type: ResponseType::Basic,
    }
  }

  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self {
      headers: vec![("Content-Type".to_string(), "application/json".to_string())],
      ..Self::new(status, value.to_string())
    }
  }

  pub fn with_type(mut self, response_type: ResponseType) -> Self {
    self.response_type = response_type;
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Eligible for the cache: exactly 200 and same-origin.
  pub fn is_storable(&self) -> bool {
    self.status == 200 && self.response_type == ResponseType::Basic
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Transport-level failure; the request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  #[error("network unreachable: {0}")]
  Unreachable(String),

  #[error("request timed out")]
  Timeout,

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// Anything that can carry a request to the origin server.
pub trait Network: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response, FetchError>> + Send;
}
