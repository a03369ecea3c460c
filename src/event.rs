use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::http::{Method, Network, Request, RequestMode};
use crate::sync::SyncTag;

/// Commands sent by the application, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentMessage {
  /// Activate the waiting generation now
  SkipWaiting,
  /// Add these URLs to the active bucket
  CacheUrls { urls: Vec<String> },
  /// Request a one-off background sync
  Sync { tag: String },
  /// Install the configured version
  Install,
  /// Activate the installed generation
  Activate,
  /// An outgoing request from the application
  Fetch(FetchMessage),
  /// Save a write for later delivery without trying the network
  Queue { payload: serde_json::Value },
  /// A pushed message from the server
  Push {
    #[serde(default)]
    body: Option<String>,
  },
  /// The user clicked a notification, optionally on one of its actions
  NotificationClick {
    #[serde(default)]
    action: Option<String>,
  },
}

/// Request carried by a `FETCH` message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FetchMessage {
  /// Absolute, or relative to the server base URL
  pub url: String,
  #[serde(default)]
  pub method: Option<Method>,
  /// JSON body, sent as `application/json`
  #[serde(default)]
  pub body: Option<serde_json::Value>,
  #[serde(default)]
  pub mode: RequestMode,
}

impl FetchMessage {
  pub fn into_request(self, base_url: &Url) -> Result<Request> {
    let url = base_url
      .join(&self.url)
      .map_err(|e| eyre!("Invalid request URL {}: {}", self.url, e))?;

    let mut request = Request::new(self.method.unwrap_or(Method::Get), url);
    request.mode = self.mode;
    if let Some(body) = self.body {
      request = request.with_header("Content-Type", "application/json");
      request.body = Some(serde_json::to_vec(&body)?);
    }
    Ok(request)
  }
}

impl AgentMessage {
  /// Map a message onto the trigger it stands for. Messages with no
  /// dedicated trigger stay `Trigger::Message`.
  pub fn into_trigger(self, base_url: &Url) -> Result<Trigger> {
    Ok(match self {
      AgentMessage::Install => Trigger::Install,
      AgentMessage::Activate => Trigger::Activate,
      AgentMessage::Sync { tag } => Trigger::Sync(tag),
      AgentMessage::Fetch(fetch) => Trigger::Fetch(fetch.into_request(base_url)?),
      AgentMessage::Push { body } => Trigger::Push(body),
      AgentMessage::NotificationClick { action } => Trigger::NotificationClick(action),
      other => Trigger::Message(other),
    })
  }
}

/// Named triggers the agent reacts to
#[derive(Debug)]
pub enum Trigger {
  Install,
  Activate,
  Fetch(Request),
  Sync(String),
  PeriodicSync(String),
  Message(AgentMessage),
  /// Result of a connectivity ping: true when the server answered
  Connectivity(bool),
  /// Pushed message text, if any
  Push(Option<String>),
  /// Notification action that was clicked, if any
  NotificationClick(Option<String>),
}

/// Timing and endpoints for the background event sources
#[derive(Debug, Clone)]
pub struct EventSources {
  pub ping_url: Url,
  pub connectivity_check: Duration,
  pub periodic_sync: Duration,
}

/// Event handler that produces triggers from connectivity pings, a periodic
/// timer and application messages
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Trigger>,
  rx: mpsc::UnboundedReceiver<Trigger>,
}

impl EventHandler {
  pub fn new<N: Network + 'static>(network: Arc<N>, sources: EventSources) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Connectivity watcher: reports every ping, the agent tracks transitions
    let ping_tx = tx.clone();
    let ping_url = sources.ping_url;
    let check = sources.connectivity_check;
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(check);
      loop {
        interval.tick().await;
        let online = matches!(
          network.fetch(&Request::get(ping_url.clone())).await,
          Ok(ref resp) if resp.is_success()
        );
        if ping_tx.send(Trigger::Connectivity(online)).is_err() {
          break;
        }
      }
    });

    // Periodic background refresh
    let periodic_tx = tx.clone();
    let periodic = sources.periodic_sync;
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(periodic);
      loop {
        interval.tick().await;
        let tag = SyncTag::RefreshSnapshots.as_str().to_string();
        if periodic_tx.send(Trigger::PeriodicSync(tag)).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  /// Read JSON-line messages from `reader` until it closes. Relative request
  /// URLs resolve against `base_url`.
  pub fn read_messages<R>(&self, reader: R, base_url: Url)
  where
    R: AsyncBufRead + Unpin + Send + 'static,
  {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      let mut lines = reader.lines();
      while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
          continue;
        }

        let trigger = parse_message(line)
          .map_err(|e| eyre!("{}", e))
          .and_then(|msg| {
            debug!(?msg, "message received");
            msg.into_trigger(&base_url)
          });
        match trigger {
          Ok(trigger) => {
            if tx.send(trigger).is_err() {
              break;
            }
          }
          Err(e) => warn!(error = %e, "ignoring malformed message"),
        }
      }
    });
  }

  /// Receive the next trigger
  pub async fn next(&mut self) -> Option<Trigger> {
    self.rx.recv().await
  }
}

pub fn parse_message(line: &str) -> serde_json::Result<AgentMessage> {
  serde_json::from_str(line)
}
