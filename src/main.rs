mod cache;
mod config;
mod http;
mod logging;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use cache::{CacheStorage, MemoryStorage, SqliteStorage};
use config::Config;
use http::{Fetcher, HttpFetcher, Method, OfflineFetcher, Request};
use worker::{CacheInterceptor, CacheSettings, Registration};

#[derive(Parser, Debug)]
#[command(name = "monitor-sw")]
#[command(about = "Offline caching agent for the Monitor IoT dashboard")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/monitor-sw/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Override the bucket name, e.g. monitor-iot-v1.1.0
  #[arg(long, global = true)]
  cache_name: Option<String>,

  /// Keep buckets in memory for this run only
  #[arg(long, global = true)]
  ephemeral: bool,

  /// More log output (-v for debug)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Seed the current bucket with the precache list
  Install,
  /// Delete every bucket but the current one
  Activate,
  /// Register the agent (install, then activate)
  Run,
  /// Send a request through the agent as a controlled page would
  Fetch {
    /// Absolute URL or path relative to the configured origin
    url: String,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Accept header, e.g. text/html for a navigation
    #[arg(long)]
    accept: Option<String>,
    /// Treat the network as unavailable
    #[arg(long)]
    offline: bool,
  },
  /// Deliver a push message to the agent
  Push {
    data: Option<String>,
  },
  /// List buckets and their entries
  Buckets,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if args.ephemeral {
    config.storage.ephemeral = true;
  }
  if let Some(name) = args.cache_name {
    config.cache_name = name;
    config.validate()?;
  }

  let _log_guard = logging::init(args.verbose, config.log.file.as_deref())?;

  let storage: Arc<dyn CacheStorage> = if config.storage.ephemeral {
    Arc::new(MemoryStorage::new())
  } else {
    Arc::new(SqliteStorage::open(config.storage.path.as_deref())?)
  };
  let http: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(config.timeout())?);
  let settings = CacheSettings::from_config(&config)?;

  match args.command {
    Command::Install => {
      let worker = CacheInterceptor::new(settings, storage, http);
      let count = worker.precache().await?;
      println!("{}: {} entries seeded", worker.settings().cache_name, count);
    }
    Command::Activate => {
      let worker = CacheInterceptor::new(settings, storage, http);
      for name in worker.purge_stale().await? {
        println!("deleted {}", name);
      }
    }
    Command::Run => {
      let worker = CacheInterceptor::new(settings, storage, http.clone());
      let mut registration = Registration::new(http);
      let state = registration.register(Arc::new(worker)).await?;
      let version = registration.active_version().unwrap_or(&config.cache_name);
      println!("{}: {}", version, state);
    }
    Command::Fetch {
      url,
      method,
      accept,
      offline,
    } => {
      let network: Arc<dyn Fetcher> = if offline {
        Arc::new(OfflineFetcher)
      } else {
        http
      };
      let worker = CacheInterceptor::new(settings, storage, network.clone());
      let mut registration = Registration::new(network);
      registration.register(Arc::new(worker)).await?;
      let client = registration.open_client();

      let mut request = Request::new(Method::parse(&method), config.resolve(&url)?);
      if let Some(accept) = accept {
        request = request.with_header("accept", accept);
      }

      let mut response = registration.fetch(client, request).await?;
      eprintln!("{} {}", response.status, response.status_text);
      for (name, value) in response.headers.iter() {
        eprintln!("{}: {}", name, value);
      }
      let body = response.bytes()?;
      std::io::stdout()
        .write_all(&body)
        .map_err(|e| eyre!("Failed to write response body: {}", e))?;
      registration.close_client(client).await;
    }
    Command::Push { data } => {
      let worker = CacheInterceptor::new(settings, storage, http.clone());
      let mut registration = Registration::new(http);
      registration.register(Arc::new(worker)).await?;
      registration.push(data.map(String::into_bytes));
    }
    Command::Buckets => {
      for name in storage.keys().await? {
        let marker = if name == config.cache_name {
          " (current)"
        } else {
          ""
        };
        println!("{}{}", name, marker);
        for key in storage.entries(&name).await? {
          println!("  {}", key);
        }
      }
    }
  }

  Ok(())
}
