use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::cache::{CacheStorage, NoopStorage, SqliteStorage};
use crate::config::Config;
use crate::db::Database;
use crate::event::{AgentMessage, EventHandler, Trigger};
use crate::fetch::{FetchInterceptor, InterceptError, InterceptPolicy, Resolved, ResponseSource};
use crate::http::{Network, Request};
use crate::lifecycle::{LifecycleController, LifecycleState, Signal};
use crate::store::{CachedKeyedRecord, DeadLetter, DurableStore, PendingWrite};
use crate::sync::{SyncAgent, SyncReport, SyncSettings, SyncTag};

/// Notification action that opens the application
const EXPLORE_ACTION: &str = "explore";

/// What a dispatched trigger produced
#[derive(Debug)]
pub enum TriggerOutcome {
  Installed(LifecycleState),
  Activated,
  Resolved(Resolved),
  Queued(PendingWrite),
  Synced(SyncReport),
  Refreshed(Option<CachedKeyedRecord>),
  Precached(usize),
  /// Skip-wait request; false when nothing was waiting
  SkippedWaiting(bool),
  ConnectivityChanged(bool),
  Notified,
  /// Notification dismissed; carries the URL opened by its action, if any
  NotificationClosed(Option<String>),
  Ignored,
}

impl TriggerOutcome {
  /// JSON line written back to the application in `run` mode.
  pub fn reply(&self) -> Option<serde_json::Value> {
    let reply = match self {
      TriggerOutcome::Installed(state) => json!({ "type": "INSTALLED", "state": state }),
      TriggerOutcome::Activated => json!({ "type": "ACTIVATED" }),
      TriggerOutcome::Resolved(resolved) => json!({
        "type": "RESPONSE",
        "status": resolved.response.status,
        "source": resolved.source.as_str(),
        "content_type": resolved.response.header("content-type"),
        "body": resolved.response.text(),
      }),
      TriggerOutcome::Queued(write) => json!({ "type": "QUEUED", "id": write.id }),
      TriggerOutcome::Synced(report) => json!({ "type": "SYNCED", "report": report }),
      TriggerOutcome::Refreshed(record) => json!({ "type": "REFRESHED", "snapshot": record }),
      TriggerOutcome::Precached(count) => json!({ "type": "PRECACHED", "count": count }),
      TriggerOutcome::SkippedWaiting(promoted) => {
        json!({ "type": "SKIPPED_WAITING", "promoted": promoted })
      }
      TriggerOutcome::ConnectivityChanged(online) => {
        json!({ "type": "CONNECTIVITY", "online": online })
      }
      TriggerOutcome::Notified => json!({ "type": "NOTIFIED" }),
      TriggerOutcome::NotificationClosed(opened) => {
        json!({ "type": "NOTIFICATION_CLOSED", "opened": opened })
      }
      TriggerOutcome::Ignored => return None,
    };
    Some(reply)
  }
}

#[derive(Debug, Serialize)]
pub struct GenerationStatus {
  pub id: u64,
  pub version: String,
  pub state: LifecycleState,
  pub controls_clients: bool,
}

#[derive(Debug, Serialize)]
pub struct BucketStatus {
  pub name: String,
  pub entries: usize,
}

/// Snapshot of agent state for the `status` command
#[derive(Debug, Serialize)]
pub struct AgentStatus {
  pub configured_version: String,
  pub active: Option<GenerationStatus>,
  pub waiting_version: Option<String>,
  pub buckets: Vec<BucketStatus>,
  pub pending_writes: Option<usize>,
  pub dead_letters: Option<Vec<DeadLetter>>,
  pub snapshot: Option<CachedKeyedRecord>,
  pub snapshot_age_secs: Option<i64>,
}

/// Owns every component of the offline agent and maps triggers to handlers.
pub struct Agent<N: Network, S: CacheStorage> {
  config: Config,
  network: Arc<N>,
  storage: Arc<S>,
  /// None when durability is unavailable
  store: Option<Arc<DurableStore>>,
  lifecycle: LifecycleController<S>,
  interceptor: FetchInterceptor<N>,
  sync: Option<SyncAgent<N>>,
  signals: Option<mpsc::UnboundedReceiver<Signal>>,
  online: Option<bool>,
}

impl<N: Network> Agent<N, SqliteStorage> {
  /// Open the agent on the configured database file.
  pub fn open(config: Config, network: N) -> Result<Self> {
    let path = config.database_path()?;
    let storage = Arc::new(SqliteStorage::new(Database::open(&path)?));
    let store = Arc::new(DurableStore::new(Database::open(&path)?));
    info!(path = %path.display(), "durable store opened");

    Self::with_parts(config, Arc::new(network), storage, Some(store))
  }
}

impl<N: Network> Agent<N, NoopStorage> {
  /// Agent without any local persistence: every read goes to the network and
  /// writes cannot be queued.
  pub fn network_only(config: Config, network: N) -> Result<Self> {
    Self::with_parts(config, Arc::new(network), Arc::new(NoopStorage), None)
  }
}

impl<N: Network, S: CacheStorage> Agent<N, S> {
  pub fn with_parts(
    config: Config,
    network: Arc<N>,
    storage: Arc<S>,
    store: Option<Arc<DurableStore>>,
  ) -> Result<Self> {
    let (tx, rx) = mpsc::unbounded_channel();

    let lifecycle = LifecycleController::new(Arc::clone(&storage), config.cache.skip_waiting_on_install)
      .with_signals(tx);
    let interceptor = FetchInterceptor::new(
      Arc::clone(&network),
      store.clone(),
      InterceptPolicy::from_config(&config)?,
    );
    let sync = match &store {
      Some(store) => Some(SyncAgent::new(
        Arc::clone(&network),
        Arc::clone(store),
        SyncSettings::from_config(&config)?,
      )),
      None => None,
    };

    Ok(Self {
      config,
      network,
      storage,
      store,
      lifecycle,
      interceptor,
      sync,
      signals: Some(rx),
      online: None,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  /// Outbound signals for the application. Can be taken once.
  pub fn take_signals(&mut self) -> Option<mpsc::UnboundedReceiver<Signal>> {
    self.signals.take()
  }

  fn store(&self) -> Result<&Arc<DurableStore>> {
    self
      .store
      .as_ref()
      .ok_or_else(|| eyre!("Durable store unavailable, running network-only"))
  }

  fn sync_agent(&self) -> Result<&SyncAgent<N>> {
    self
      .sync
      .as_ref()
      .ok_or_else(|| eyre!("Durable store unavailable, nothing to sync"))
  }

  /// Bring up the configured version.
  ///
  /// An existing bucket for this version is reused as is. Otherwise the most
  /// recent older bucket is restored first so it keeps serving if the install
  /// of the new version fails.
  pub async fn start(&mut self) -> Result<()> {
    let version = self.config.cache.bucket_name();
    if self.lifecycle.restore(&version)? {
      return Ok(());
    }

    let resumed = match self.storage.bucket_names()?.pop() {
      Some(latest) => self.lifecycle.restore(&latest)?,
      None => false,
    };

    match self.install().await {
      Ok(_) => Ok(()),
      Err(e) if resumed => {
        warn!(error = %e, "install failed, previous version keeps serving");
        Ok(())
      }
      Err(e) => Err(e),
    }
  }

  /// Install the configured version with the configured baseline URLs.
  pub async fn install(&mut self) -> Result<LifecycleState> {
    let version = self.config.cache.bucket_name();
    let urls = self
      .config
      .cache
      .precache
      .iter()
      .map(|u| self.config.server.resolve(u))
      .collect::<Result<Vec<_>>>()?;

    self
      .lifecycle
      .install(self.network.as_ref(), &version, &urls)
      .await
  }

  /// Resolve one intercepted request against the active generation.
  pub async fn fetch(&self, request: &Request) -> Result<Resolved, InterceptError> {
    let resolved = match self.lifecycle.active() {
      Some(generation) => self.interceptor.resolve(generation.cache(), request).await?,
      None => self.interceptor.pass_through(request).await?,
    };

    if let ResponseSource::Queued { id } = resolved.source {
      self.lifecycle.emit(Signal::WriteQueued { id });
    }
    Ok(resolved)
  }

  /// Queue a write for later delivery without trying the network first.
  pub fn queue(&self, payload: &serde_json::Value) -> Result<PendingWrite> {
    let write = self.store()?.enqueue(payload, None)?;
    self.lifecycle.emit(Signal::WriteQueued { id: write.id });
    Ok(write)
  }

  pub async fn flush(&self) -> Result<SyncReport> {
    let report = self.sync_agent()?.flush_pending_writes().await?;
    self.lifecycle.emit(Signal::SyncCompleted(report));
    Ok(report)
  }

  pub async fn refresh(&self) -> Result<Option<CachedKeyedRecord>> {
    self.sync_agent()?.refresh_snapshots().await
  }

  /// Warm extra URLs into the active bucket.
  pub async fn precache(&self, urls: &[String]) -> Result<usize> {
    let generation = self
      .lifecycle
      .active()
      .ok_or_else(|| eyre!("No active generation to cache into"))?;

    let urls = urls
      .iter()
      .map(|u| self.config.server.resolve(u))
      .collect::<Result<Vec<_>>>()?;

    generation.cache().warm(self.network.as_ref(), &urls).await
  }

  /// Raise a notification for a pushed message.
  pub fn notify(&self, body: Option<String>) -> TriggerOutcome {
    let notify = &self.config.notify;
    self.lifecycle.emit(Signal::Notify {
      title: notify.title.clone(),
      body: body.unwrap_or_else(|| notify.fallback_body.clone()),
    });
    TriggerOutcome::Notified
  }

  /// Handle a click on a notification. Only the explore action opens a window.
  pub fn notification_click(&self, action: Option<&str>) -> Result<TriggerOutcome> {
    if action != Some(EXPLORE_ACTION) {
      return Ok(TriggerOutcome::NotificationClosed(None));
    }

    let url = self.config.server.resolve(&self.config.notify.open_url)?.to_string();
    self.lifecycle.emit(Signal::OpenWindow { url: url.clone() });
    Ok(TriggerOutcome::NotificationClosed(Some(url)))
  }

  async fn run_sync_tag(&self, tag: &str) -> Result<TriggerOutcome> {
    match SyncTag::parse(tag) {
      Some(SyncTag::FlushPendingWrites) => Ok(TriggerOutcome::Synced(self.flush().await?)),
      Some(SyncTag::RefreshSnapshots) => Ok(TriggerOutcome::Refreshed(self.refresh().await?)),
      None => {
        warn!(tag, "unknown sync tag");
        Ok(TriggerOutcome::Ignored)
      }
    }
  }

  /// Run the handler for one trigger to completion.
  pub async fn dispatch(&mut self, trigger: Trigger) -> Result<TriggerOutcome> {
    let trigger = match trigger {
      Trigger::Message(message) => message.into_trigger(&self.config.server.base_url()?)?,
      other => other,
    };

    match trigger {
      Trigger::Install => Ok(TriggerOutcome::Installed(self.install().await?)),
      Trigger::Activate => {
        self.lifecycle.activate()?;
        Ok(TriggerOutcome::Activated)
      }
      Trigger::Fetch(request) => Ok(TriggerOutcome::Resolved(self.fetch(&request).await?)),
      Trigger::Sync(tag) | Trigger::PeriodicSync(tag) => self.run_sync_tag(&tag).await,
      Trigger::Connectivity(online) => self.connectivity(online).await,
      Trigger::Push(body) => Ok(self.notify(body)),
      Trigger::NotificationClick(action) => self.notification_click(action.as_deref()),
      Trigger::Message(AgentMessage::SkipWaiting) => {
        Ok(TriggerOutcome::SkippedWaiting(self.lifecycle.skip_waiting()?))
      }
      Trigger::Message(AgentMessage::CacheUrls { urls }) => {
        Ok(TriggerOutcome::Precached(self.precache(&urls).await?))
      }
      Trigger::Message(AgentMessage::Queue { payload }) => {
        Ok(TriggerOutcome::Queued(self.queue(&payload)?))
      }
      Trigger::Message(other) => {
        warn!(?other, "unhandled message");
        Ok(TriggerOutcome::Ignored)
      }
    }
  }

  async fn connectivity(&mut self, online: bool) -> Result<TriggerOutcome> {
    if self.online == Some(online) {
      return Ok(TriggerOutcome::Ignored);
    }
    self.online = Some(online);

    if online {
      info!("connection restored");
      self.lifecycle.emit(Signal::Online);
      if self.sync.is_some() {
        self.flush().await?;
      }
    } else {
      warn!("offline, writes will be stored locally");
      self.lifecycle.emit(Signal::Offline);
    }
    Ok(TriggerOutcome::ConnectivityChanged(online))
  }

  /// Process triggers until the event sources close or ctrl-c, handing each
  /// outcome's reply to `reply`.
  pub async fn run(
    &mut self,
    mut events: EventHandler,
    mut reply: impl FnMut(serde_json::Value),
  ) -> Result<()> {
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
      let trigger = tokio::select! {
        trigger = events.next() => trigger,
        _ = &mut shutdown => {
          info!("shutting down");
          break;
        }
      };
      let Some(trigger) = trigger else { break };

      tokio::select! {
        outcome = self.dispatch(trigger) => match outcome {
          Ok(outcome) => {
            if let Some(value) = outcome.reply() {
              reply(value);
            }
          }
          Err(e) => {
            error!(error = %e, "trigger failed");
            reply(json!({ "type": "ERROR", "error": format!("{:#}", e) }));
          }
        },
        _ = &mut shutdown => {
          info!("shutting down, abandoning current trigger");
          break;
        }
      }
    }
    Ok(())
  }

  /// Report state without activating or evicting anything.
  pub fn status(&self) -> Result<AgentStatus> {
    let buckets = self
      .storage
      .bucket_names()?
      .into_iter()
      .map(|name| {
        let entries = self.storage.entry_count(&name)?;
        Ok(BucketStatus { name, entries })
      })
      .collect::<Result<Vec<_>>>()?;

    let (pending_writes, dead_letters, snapshot) = match &self.store {
      Some(store) => (
        Some(store.pending_count()?),
        Some(store.dead_letters()?),
        store.snapshot(&self.config.sync.snapshot_key)?,
      ),
      None => (None, None, None),
    };
    let now = Utc::now();
    let snapshot_age_secs = snapshot.as_ref().map(|s| s.age(now).num_seconds());

    Ok(AgentStatus {
      configured_version: self.config.cache.bucket_name(),
      active: self.lifecycle.active().map(|g| GenerationStatus {
        id: g.id(),
        version: g.version().to_string(),
        state: g.state(),
        controls_clients: g.controls_clients(),
      }),
      waiting_version: self.lifecycle.waiting().map(|g| g.version().to_string()),
      buckets,
      pending_writes,
      dead_letters,
      snapshot,
      snapshot_age_secs,
    })
  }
}
