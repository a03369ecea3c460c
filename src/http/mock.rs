//! In-process network double for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use super::{FetchError, Method, Network, Request, Response};

pub const BASE: &str = "http://app.local";

pub fn url(path: &str) -> Url {
  Url::parse(BASE).unwrap().join(path).unwrap()
}

type Rejector = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// Route table with an online switch and a call counter.
///
/// Unknown routes answer 404. While offline every fetch fails with
/// `FetchError::Unreachable` but is still counted.
pub struct MockNetwork {
  routes: Mutex<HashMap<(Method, String), Response>>,
  online: AtomicBool,
  calls: AtomicUsize,
  requests: Mutex<Vec<Request>>,
  rejectors: Mutex<Vec<Rejector>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: AtomicUsize::new(0),
      requests: Mutex::new(Vec::new()),
      rejectors: Mutex::new(Vec::new()),
    }
  }

  pub fn route(&self, method: Method, path: &str, response: Response) -> &Self {
    self
      .routes
      .lock()
      .unwrap()
      .insert((method, url(path).to_string()), response);
    self
  }

  /// Answer 500 for every request matching `pred`.
  pub fn reject_if(&self, pred: impl Fn(&Request) -> bool + Send + Sync + 'static) {
    self.rejectors.lock().unwrap().push(Box::new(pred));
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn reset_calls(&self) {
    self.calls.store(0, Ordering::SeqCst);
    self.requests.lock().unwrap().clear();
  }

  pub fn requests(&self) -> Vec<Request> {
    self.requests.lock().unwrap().clone()
  }
}

impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.requests.lock().unwrap().push(request.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable("offline".to_string()));
    }

    if self.rejectors.lock().unwrap().iter().any(|r| r(request)) {
      return Ok(Response::new(500, "rejected"));
    }

    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(&(request.method, request.url.to_string()))
        .cloned()
        .unwrap_or_else(|| Response::new(404, "not found")),
    )
  }
}
