use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub server: ServerConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub notify: NotifyConfig,
  #[serde(default)]
  pub log: LogConfig,
  /// Database file (defaults to $XDG_DATA_HOME/outpost/agent.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  /// Origin of the web application, e.g. "http://localhost:5000"
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      timeout_secs: default_timeout_secs(),
    }
  }
}

impl ServerConfig {
  pub fn base_url(&self) -> Result<Url> {
    Url::parse(&self.base_url).map_err(|e| eyre!("Invalid server URL {}: {}", self.base_url, e))
  }

  /// Resolve an app-relative path (or absolute URL) against the server origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .base_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL {}: {}", path, e))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Bucket name prefix; the version is appended as "-v<N>"
  #[serde(default = "default_cache_name")]
  pub name: String,
  #[serde(default = "default_cache_version")]
  pub version: u32,
  /// URLs warmed on install
  #[serde(default = "default_precache")]
  pub precache: Vec<String>,
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Requests under this path prefix are always network-first
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Activate a freshly installed generation without waiting for clients to close
  #[serde(default = "default_true")]
  pub skip_waiting_on_install: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      name: default_cache_name(),
      version: default_cache_version(),
      precache: default_precache(),
      offline_page: default_offline_page(),
      api_prefix: default_api_prefix(),
      skip_waiting_on_install: true,
    }
  }
}

impl CacheConfig {
  pub fn bucket_name(&self) -> String {
    format!("{}-v{}", self.name, self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Endpoint queued writes are replayed against
  #[serde(default = "default_write_endpoint")]
  pub write_endpoint: String,
  /// Mutating requests to these paths are queued when the network is down.
  /// Defaults to just the write endpoint.
  #[serde(default)]
  pub queue_paths: Vec<String>,
  #[serde(default = "default_stats_endpoint")]
  pub stats_endpoint: String,
  #[serde(default = "default_snapshot_key")]
  pub snapshot_key: String,
  #[serde(default = "default_ping_endpoint")]
  pub ping_endpoint: String,
  #[serde(default = "default_connectivity_check_secs")]
  pub connectivity_check_secs: u64,
  #[serde(default = "default_periodic_secs")]
  pub periodic_secs: u64,
  /// Dead-letter a queued write after this many failed replays. Unset retries forever.
  pub max_attempts: Option<u32>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      write_endpoint: default_write_endpoint(),
      queue_paths: Vec::new(),
      stats_endpoint: default_stats_endpoint(),
      snapshot_key: default_snapshot_key(),
      ping_endpoint: default_ping_endpoint(),
      connectivity_check_secs: default_connectivity_check_secs(),
      periodic_secs: default_periodic_secs(),
      max_attempts: None,
    }
  }
}

impl SyncConfig {
  pub fn queue_paths(&self) -> Vec<String> {
    if self.queue_paths.is_empty() {
      vec![self.write_endpoint.clone()]
    } else {
      self.queue_paths.clone()
    }
  }
}

/// Pushed-message notifications
#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
  #[serde(default = "default_notify_title")]
  pub title: String,
  /// Body used when a push carries no text
  #[serde(default = "default_notify_body")]
  pub fallback_body: String,
  /// Opened when the notification's "explore" action is clicked
  #[serde(default = "default_open_url")]
  pub open_url: String,
}

impl Default for NotifyConfig {
  fn default() -> Self {
    Self {
      title: default_notify_title(),
      fallback_body: default_notify_body(),
      open_url: default_open_url(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// Filter used when RUST_LOG is not set
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write a daily-rotated log file into the data directory
  #[serde(default)]
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: false,
    }
  }
}

fn default_base_url() -> String {
  "http://localhost:5000".to_string()
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_cache_name() -> String {
  "automaten-manager".to_string()
}

fn default_cache_version() -> u32 {
  1
}

fn default_precache() -> Vec<String> {
  ["/", "/static/manifest.json", "/login", "/offline.html"]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_true() -> bool {
  true
}

fn default_write_endpoint() -> String {
  "/api/entries".to_string()
}

fn default_stats_endpoint() -> String {
  "/api/dashboard/stats".to_string()
}

fn default_snapshot_key() -> String {
  "dashboard_stats".to_string()
}

fn default_ping_endpoint() -> String {
  "/api/pwa/ping".to_string()
}

fn default_connectivity_check_secs() -> u64 {
  15
}

fn default_periodic_secs() -> u64 {
  300
}

fn default_notify_title() -> String {
  "Automaten Manager".to_string()
}

fn default_notify_body() -> String {
  "Neue Benachrichtigung".to_string()
}

fn default_open_url() -> String {
  "/".to_string()
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./outpost.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/outpost/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("outpost.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("outpost").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.server.base_url()?;
    Ok(config)
  }

  /// Directory for the database and log files.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("outpost"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(p) => Ok(p.clone()),
      None => Ok(Self::data_dir()?.join("agent.db")),
    }
  }
}
