mod agent;
mod cache;
mod config;
mod db;
mod event;
mod fetch;
mod http;
mod lifecycle;
mod logging;
mod store;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tracing::{info, warn};

use agent::Agent;
use cache::CacheStorage;
use event::{EventHandler, EventSources};
use http::client::HttpNetwork;
use http::{Method, Request};

#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(about = "Offline request cache and sync agent for the Automaten Manager web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/outpost/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the server base URL
  #[arg(short, long)]
  server: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version and warm its cache
  Install,
  /// Resolve one request through the agent and print the body
  Fetch {
    /// Absolute URL or path relative to the server
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// JSON request body
    #[arg(short, long)]
    data: Option<String>,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Queue a JSON write for later delivery
  Queue { payload: String },
  /// Replay queued writes now
  Sync,
  /// Refresh the dashboard snapshot
  Refresh,
  /// Show versions, queue and snapshot state
  Status,
  /// Run the agent until interrupted, reading JSON-line messages from stdin
  /// and writing replies and signals to stdout
  Run,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(server) = args.server {
    config.server.base_url = server;
    config.server.base_url()?;
  }

  let _log_guard = logging::init(&config.log)?;

  match Agent::open(config.clone(), HttpNetwork::from_config(&config)?) {
    Ok(agent) => execute(agent, args.command).await,
    Err(e) => {
      warn!(error = %e, "durable store unavailable, running network-only");
      let agent = Agent::network_only(config.clone(), HttpNetwork::from_config(&config)?)?;
      execute(agent, args.command).await
    }
  }
}

async fn execute<S: CacheStorage>(mut agent: Agent<HttpNetwork, S>, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      let state = agent.install().await?;
      println!("{}: {}", agent.config().cache.bucket_name(), state);
    }
    Command::Fetch {
      url,
      method,
      data,
      navigate,
    } => {
      // Reads still go to the network and writes still queue without a cache
      if let Err(e) = agent.start().await {
        warn!(error = %e, "no cache generation available, passing through");
      }

      let url = agent.config().server.resolve(&url)?;
      let method: Method = method.parse()?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      request.method = method;
      if let Some(data) = data {
        let payload: serde_json::Value =
          serde_json::from_str(&data).map_err(|e| eyre!("Request body is not JSON: {}", e))?;
        request = request.with_header("Content-Type", "application/json");
        request.body = Some(serde_json::to_vec(&payload)?);
      }

      let resolved = agent.fetch(&request).await?;
      info!(
        status = resolved.response.status,
        source = resolved.source.as_str(),
        "request resolved"
      );
      println!("{}", resolved.response.text());
    }
    Command::Queue { payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not JSON: {}", e))?;
      let write = agent.queue(&payload)?;
      println!("{}", serde_json::to_string(&write)?);
    }
    Command::Sync => {
      let report = agent.flush().await?;
      println!("{}", serde_json::to_string(&report)?);
    }
    Command::Refresh => {
      let record = agent.refresh().await?;
      println!("{}", serde_json::to_string_pretty(&record)?);
    }
    Command::Status => {
      println!("{}", serde_json::to_string_pretty(&agent.status()?)?);
    }
    Command::Run => {
      agent.start().await?;

      // Signals go to stdout as JSON lines
      if let Some(mut signals) = agent.take_signals() {
        tokio::spawn(async move {
          while let Some(signal) = signals.recv().await {
            match serde_json::to_string(&signal) {
              Ok(line) => println!("{}", line),
              Err(e) => warn!(error = %e, "failed to encode signal"),
            }
          }
        });
      }

      let sync = &agent.config().sync;
      let sources = EventSources {
        ping_url: agent.config().server.resolve(&sync.ping_endpoint)?,
        connectivity_check: Duration::from_secs(sync.connectivity_check_secs),
        periodic_sync: Duration::from_secs(sync.periodic_secs),
      };
      let events = EventHandler::new(Arc::clone(agent.network()), sources);
      events.read_messages(BufReader::new(tokio::io::stdin()), agent.config().server.base_url()?);

      info!(version = %agent.config().cache.bucket_name(), "agent running");
      agent.run(events, |reply| println!("{}", reply)).await?;
    }
  }

  Ok(())
}
