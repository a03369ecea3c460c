//! Install/activate/update transitions of agent generations.
//!
//! Each generation owns one cache bucket. At most one generation is active
//! and at most one waits for activation. Activating a generation evicts every
//! other bucket, so only one cache version ever serves.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use url::Url;

use crate::cache::{CacheManager, CacheStorage};
use crate::http::Network;
use crate::sync::SyncReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  /// Warmed, waiting to activate
  Installed,
  Activating,
  Active,
  /// Replaced by a newer active generation
  Superseded,
  /// Install failed; never served
  Redundant,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Active => "active",
      LifecycleState::Superseded => "superseded",
      LifecycleState::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

/// Informational notices for the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
  /// A new version is installed and waiting
  UpdateAvailable { version: String },
  Activated { version: String },
  /// Clients should reload to pick up the new generation
  ReloadClients,
  Online,
  Offline,
  WriteQueued { id: i64 },
  SyncCompleted(SyncReport),
  /// Show a notification for a pushed message
  Notify { title: String, body: String },
  /// Open an application window at `url`
  OpenWindow { url: String },
}

/// Explicit agent state for one deployed version.
pub struct Generation<S: CacheStorage> {
  id: u64,
  state: LifecycleState,
  cache: CacheManager<S>,
  controls_clients: bool,
}

impl<S: CacheStorage> Generation<S> {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn version(&self) -> &str {
    self.cache.bucket()
  }

  pub fn state(&self) -> LifecycleState {
    self.state
  }

  pub fn cache(&self) -> &CacheManager<S> {
    &self.cache
  }

  pub fn controls_clients(&self) -> bool {
    self.controls_clients
  }
}

pub struct LifecycleController<S: CacheStorage> {
  storage: Arc<S>,
  active: Option<Generation<S>>,
  waiting: Option<Generation<S>>,
  next_id: u64,
  skip_waiting_on_install: bool,
  signals: Option<mpsc::UnboundedSender<Signal>>,
}

impl<S: CacheStorage> LifecycleController<S> {
  pub fn new(storage: Arc<S>, skip_waiting_on_install: bool) -> Self {
    Self {
      storage,
      active: None,
      waiting: None,
      next_id: 1,
      skip_waiting_on_install,
      signals: None,
    }
  }

  pub fn with_signals(mut self, tx: mpsc::UnboundedSender<Signal>) -> Self {
    self.signals = Some(tx);
    self
  }

  pub fn active(&self) -> Option<&Generation<S>> {
    self.active.as_ref()
  }

  pub fn waiting(&self) -> Option<&Generation<S>> {
    self.waiting.as_ref()
  }

  pub fn emit(&self, signal: Signal) {
    if let Some(tx) = &self.signals {
      // Nobody listening is fine
      let _ = tx.send(signal);
    }
  }

  fn new_generation(&mut self, version: &str, state: LifecycleState) -> Generation<S> {
    let id = self.next_id;
    self.next_id += 1;
    Generation {
      id,
      state,
      cache: CacheManager::new(Arc::clone(&self.storage), version),
      controls_clients: false,
    }
  }

  /// Resume a version whose bucket survived from a previous run, without
  /// re-warming it. Returns false when there is nothing to resume.
  pub fn restore(&mut self, version: &str) -> Result<bool> {
    if self.active.as_ref().is_some_and(|g| g.version() == version) {
      return Ok(true);
    }
    if !self.storage.has_bucket(version)? {
      return Ok(false);
    }

    info!(version, "restoring cached generation");
    let generation = self.new_generation(version, LifecycleState::Installed);
    self.waiting = Some(generation);
    self.activate()?;
    Ok(true)
  }

  /// Install `version` by warming its bucket with `urls`.
  ///
  /// A failed warm leaves the generation redundant and the current active
  /// generation untouched. On success the generation activates right away
  /// when nothing is active or skip-waiting is configured, and waits otherwise.
  pub async fn install<N: Network>(
    &mut self,
    network: &N,
    version: &str,
    urls: &[Url],
  ) -> Result<LifecycleState> {
    let mut generation = self.new_generation(version, LifecycleState::Installing);
    info!(version, id = generation.id, "installing");

    if let Err(e) = generation.cache.warm(network, urls).await {
      generation.state = LifecycleState::Redundant;
      error!(version, error = %e, "install failed");
      return Err(e);
    }

    generation.state = LifecycleState::Installed;
    self.waiting = Some(generation);

    if self.active.is_none() || self.skip_waiting_on_install {
      self.activate()?;
      Ok(LifecycleState::Active)
    } else {
      info!(version, "installed, waiting for activation");
      self.emit(Signal::UpdateAvailable {
        version: version.to_string(),
      });
      Ok(LifecycleState::Installed)
    }
  }

  /// Promote the waiting generation: evict every other bucket, then take
  /// control of all clients.
  pub fn activate(&mut self) -> Result<()> {
    let mut generation = self
      .waiting
      .take()
      .ok_or_else(|| eyre!("No installed generation to activate"))?;

    generation.state = LifecycleState::Activating;
    if let Err(e) = generation.cache.evict_stale() {
      generation.state = LifecycleState::Installed;
      self.waiting = Some(generation);
      return Err(e);
    }

    generation.controls_clients = true;
    generation.state = LifecycleState::Active;
    let version = generation.version().to_string();

    if let Some(mut previous) = self.active.replace(generation) {
      previous.state = LifecycleState::Superseded;
      previous.controls_clients = false;
      info!(version = previous.version(), "generation superseded");
    }

    info!(%version, "activated, clients claimed");
    self.emit(Signal::Activated { version });
    Ok(())
  }

  /// Force the waiting generation active and ask clients to reload.
  /// Returns false when nothing is waiting.
  pub fn skip_waiting(&mut self) -> Result<bool> {
    if self.waiting.is_none() {
      return Ok(false);
    }

    self.activate()?;
    self.emit(Signal::ReloadClients);
    Ok(true)
  }
}
