mod cache;
mod config;
mod logging;
mod net;
mod page;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use net::{HttpNetwork, Request};
use page::{PageHost, StalenessChecker, SystemClock, UpdateNotifier};
use worker::{Registration, Worker};

#[derive(Parser, Debug)]
#[command(name = "folio-offline")]
#[command(about = "Offline cache and update worker for a static portfolio site")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/folio-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Cache version to run as, overriding cache.version
  #[arg(long)]
  cache_version: Option<String>,

  /// Cache database (default: $XDG_DATA_HOME/folio-offline/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version, seed its bucket and drop older buckets
  Install,
  /// Send one request through the worker
  Fetch {
    /// Absolute URL, or a path on the configured origin
    url: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
    /// Print the response body
    #[arg(long)]
    body: bool,
  },
  /// Wipe and reseed the current bucket
  ClearCache,
  /// List cache buckets
  Buckets,
  /// Decide whether a content refresh is due
  CheckContent {
    /// Minimum seconds between refreshes (default: page.content_interval_secs)
    #[arg(long)]
    interval_secs: Option<u64>,
  },
  /// Print the cache-busted worker registration URL
  RegistrationUrl,
}

type Runtime = (
  Arc<SqliteStorage>,
  Arc<HttpNetwork>,
  Arc<Registration<SqliteStorage, HttpNetwork>>,
);

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _log_guard = logging::init()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override version if specified on command line
  let config = if let Some(version) = args.cache_version {
    let mut config = config;
    config.cache.version = version;
    config
  } else {
    config
  };

  let storage = Arc::new(match &args.db {
    Some(path) => SqliteStorage::open_at(path)?,
    None => SqliteStorage::open()?,
  });

  match args.command {
    Command::Install => install(&config, storage).await,
    Command::Fetch {
      url,
      navigate,
      method,
      body,
    } => fetch(&config, storage, &url, navigate, &method, body).await,
    Command::ClearCache => clear_cache(&config, storage).await,
    Command::Buckets => buckets(&config, &storage),
    Command::CheckContent { interval_secs } => {
      let interval = interval_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.page.content_interval());
      let checker = StalenessChecker::new(storage.as_ref(), SystemClock);
      let due = checker.check_and_update_content(interval)?;
      println!("{}", if due { "refresh" } else { "fresh" });
      Ok(())
    }
    Command::RegistrationUrl => {
      let url = page::registration_url(
        &config.origin,
        &config.page.worker_script,
        chrono::Utc::now(),
      )?;
      println!("{}", url);
      Ok(())
    }
  }
}

fn runtime(config: &Config, storage: Arc<SqliteStorage>) -> Result<Runtime> {
  let network = Arc::new(HttpNetwork::new(config.network.timeout())?);
  let registration = Arc::new(Registration::new(Arc::clone(&network)));
  Ok((storage, network, registration))
}

/// The version whose bucket was last activated under the configured prefix.
fn activated_version(config: &Config, storage: &SqliteStorage) -> Result<Option<String>> {
  let scope = format!("{}-", config.cache.prefix);
  for name in storage.bucket_names()? {
    if let Some(version) = name.strip_prefix(&scope) {
      if storage.is_activated(&name)? {
        return Ok(Some(version.to_string()));
      }
    }
  }
  Ok(None)
}

/// Put the version activated by an earlier run back in control.
async fn resume_activated(config: &Config, runtime: &Runtime) -> Result<()> {
  let (storage, network, registration) = runtime;
  if let Some(version) = activated_version(config, storage)? {
    let mut previous = config.clone();
    previous.cache.version = version;
    let worker = Worker::new(&previous, Arc::clone(storage), Arc::clone(network))?;
    registration.resume(worker).await?;
  }
  Ok(())
}

/// Resume the last activated version and register the configured one if it
/// is not already in control. A newer version installed this way waits.
async fn controlled(config: &Config, storage: Arc<SqliteStorage>) -> Result<Runtime> {
  let runtime = runtime(config, storage)?;
  resume_activated(config, &runtime).await?;

  let (storage, network, registration) = &runtime;
  let current = registration
    .active()
    .await
    .is_some_and(|w| w.version() == config.cache.version);
  if !current {
    let worker = Worker::new(config, Arc::clone(storage), Arc::clone(network))?;
    registration.register(worker).await?;
  }

  Ok(runtime)
}

/// Install the configured version.
///
/// If another version of the site was activated before it becomes the
/// current controller, and the user is asked before the new version takes
/// over.
async fn install(config: &Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let runtime = runtime(config, storage)?;
  resume_activated(config, &runtime).await?;
  let (storage, network, registration) = runtime;

  if let Some(active) = registration.active().await {
    if active.version() == config.cache.version {
      println!("active: {} (already installed)", active.bucket());
      return Ok(());
    }
  }

  let handle = worker::runtime::spawn(Arc::clone(&registration));
  let mut events = registration.subscribe();
  let worker = Worker::new(config, Arc::clone(&storage), network)?;
  registration.register(worker).await?;

  let mut notifier = UpdateNotifier::new(TerminalPage, handle);
  loop {
    let event = if notifier.awaiting_controller() {
      tokio::time::timeout(config.page.message_timeout(), events.recv())
        .await
        .map_err(|_| eyre!("Timed out waiting for the new version to take control"))?
    } else {
      match events.try_recv() {
        Ok(event) => Ok(event),
        Err(_) => break,
      }
    };
    let event = event.map_err(|e| eyre!("Lifecycle events unavailable: {}", e))?;
    notifier.handle_event(&event)?;
  }

  let active = registration.active().await;
  let waiting = registration.waiting().await;
  println!(
    "active: {}",
    active.map(|w| w.bucket().to_string()).unwrap_or_else(|| "-".to_string())
  );
  if let Some(worker) = waiting {
    println!("waiting: {} ({:?})", worker.bucket(), worker.state());
  }
  Ok(())
}

/// Update prompts on the terminal.
struct TerminalPage;

impl PageHost for TerminalPage {
  fn confirm(&mut self, message: &str) -> bool {
    use std::io::Write;

    print!("{} [y/N] ", message);
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
      return false;
    }
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
  }

  fn reload(&mut self) {
    println!("New version is in control.");
  }
}

async fn fetch(
  config: &Config,
  storage: Arc<SqliteStorage>,
  target: &str,
  navigate: bool,
  method: &str,
  print_body: bool,
) -> Result<()> {
  let url = config
    .origin
    .join(target)
    .map_err(|e| eyre!("Invalid URL {}: {}", target, e))?;
  let method = method
    .to_uppercase()
    .parse::<reqwest::Method>()
    .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  }
  .with_method(method);

  let (_storage, _network, registration) = controlled(config, storage).await?;
  let result = registration.fetch(&request).await?;
  if let Some(worker) = registration.active().await {
    worker.settle().await;
  }

  println!(
    "{} {} {} {} bytes",
    result.source,
    result.data.status,
    result.data.header("content-type").unwrap_or("-"),
    result.data.body.len()
  );
  if let Some(cached_at) = result.cached_at {
    println!("cached at {}", cached_at);
  }
  if print_body {
    println!("{}", String::from_utf8_lossy(&result.data.body));
  }
  Ok(())
}

async fn clear_cache(config: &Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let (_storage, _network, registration) = controlled(config, storage).await?;
  let handle = worker::runtime::spawn(registration);

  let outcome = page::clear_cache(&handle, config.page.message_timeout()).await?;
  println!("cleared {} at {}", config.bucket_name(), outcome.cleared_at);
  Ok(())
}

fn buckets(config: &Config, storage: &SqliteStorage) -> Result<()> {
  let current = config.bucket_name();
  for name in storage.bucket_names()? {
    let marker = if name == current { "*" } else { " " };
    let activated = if storage.is_activated(&name)? { ", activated" } else { "" };
    println!(
      "{} {} ({} entries{})",
      marker,
      name,
      storage.entry_count(&name)?,
      activated
    );
  }
  Ok(())
}
