use crate::config::Config;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use url::{Origin, Url};

use super::{FetchError, Network, Request, RequestMode, Response, ResponseType};

/// reqwest-backed network used outside of tests
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpNetwork {
  pub fn new(base_url: &Url, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      origin: base_url.origin(),
    })
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    let base_url = config.server.base_url()?;
    Self::new(&base_url, Duration::from_secs(config.server.timeout_secs))
  }

  /// Same-origin responses are `basic`. Cross-origin ones are `cors`, or
  /// `opaque` when the application asked for a no-cors request.
  fn response_type(&self, final_url: &Url, mode: RequestMode) -> ResponseType {
    if final_url.origin() == self.origin {
      return ResponseType::Basic;
    }
    match mode {
      RequestMode::NoCors => ResponseType::Opaque,
      RequestMode::Navigate | RequestMode::SameOrigin | RequestMode::Cors => ResponseType::Cors,
    }
  }
}

impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
      .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder.send().await.map_err(classify)?;

    let response_type = self.response_type(resp.url(), request.mode);
    let status = resp.status().as_u16();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|v| (k.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = resp.bytes().await.map_err(classify)?.to_vec();

    Ok(
      Response {
        headers,
        ..Response::new(status, body)
      }
      .with_type(response_type),
    )
  }
}

fn classify(err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout
  } else {
    FetchError::Unreachable(err.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Method;
  use wiremock::matchers::{body_json, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn network_for(server: &MockServer) -> HttpNetwork {
    let base = Url::parse(&server.uri()).unwrap();
    HttpNetwork::new(&base, Duration::from_secs(5)).unwrap()
  }

  #[tokio::test]
  async fn test_same_origin_response_is_basic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/login"))
      .respond_with(ResponseTemplate::new(200).set_body_string("<form>"))
      .mount(&server)
      .await;

    let network = network_for(&server);
    let url = Url::parse(&format!("{}/login", server.uri())).unwrap();
    let resp = network.fetch(&Request::get(url)).await.unwrap();

    assert_eq!(resp.status, 200);
    assert_eq!(resp.text(), "<form>");
    assert_eq!(resp.response_type, ResponseType::Basic);
    assert!(resp.is_storable());
  }

  #[tokio::test]
  async fn test_cross_origin_response_is_not_basic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;

    let other = Url::parse("http://elsewhere.invalid").unwrap();
    let network = HttpNetwork::new(&other, Duration::from_secs(5)).unwrap();
    let url = Url::parse(&format!("{}/style.css", server.uri())).unwrap();
    let resp = network.fetch(&Request::get(url)).await.unwrap();

    assert_eq!(resp.response_type, ResponseType::Cors);
    assert!(!resp.is_storable());
  }

  #[tokio::test]
  async fn test_cross_origin_no_cors_response_is_opaque() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_string("font"))
      .mount(&server)
      .await;

    let other = Url::parse("http://elsewhere.invalid").unwrap();
    let network = HttpNetwork::new(&other, Duration::from_secs(5)).unwrap();
    let mut request = Request::get(Url::parse(&format!("{}/font.woff", server.uri())).unwrap());
    request.mode = RequestMode::NoCors;
    let resp = network.fetch(&request).await.unwrap();

    assert_eq!(resp.response_type, ResponseType::Opaque);
    assert!(!resp.is_storable());
  }

  #[tokio::test]
  async fn test_post_forwards_body_and_headers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/entries"))
      .and(header("Content-Type", "application/json"))
      .and(body_json(serde_json::json!({"amount": 3})))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let network = network_for(&server);
    let url = Url::parse(&format!("{}/api/entries", server.uri())).unwrap();
    let req = Request::post_json(url, &serde_json::json!({"amount": 3})).unwrap();
    assert_eq!(req.method, Method::Post);

    let resp = network.fetch(&req).await.unwrap();
    assert_eq!(resp.status, 201);
  }

  #[tokio::test]
  async fn test_unreachable_host_is_fetch_error() {
    // Port 9 (discard) is essentially never listening locally
    let base = Url::parse("http://127.0.0.1:9").unwrap();
    let network = HttpNetwork::new(&base, Duration::from_secs(2)).unwrap();
    let result = network.fetch(&Request::get(base.clone())).await;

    assert!(matches!(
      result,
      Err(FetchError::Unreachable(_)) | Err(FetchError::Timeout)
    ));
  }
}
