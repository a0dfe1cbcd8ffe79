//! A single worker version: install, activate, serve, clear.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::WorkerReply;
use super::strategy::{ImagePolicy, Strategy, StrategyTable};
use crate::cache::{CacheLayer, CacheResult, CacheStorage};
use crate::config::Config;
use crate::net::{Network, Request, Response};

/// Lifecycle state of a worker version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Created, not yet installed
  Parsed,
  Installing,
  /// Installed and waiting for the current controller to let go
  Installed,
  Activating,
  Activated,
  /// Failed to install, or replaced by a newer version
  Redundant,
}

/// One versioned instance of the cache worker.
///
/// The version only affects the bucket name, so several versions can share
/// one storage backend side by side.
pub struct Worker<S: CacheStorage, N: Network> {
  version: String,
  prefix: String,
  site_root: Url,
  seed: Vec<Url>,
  table: StrategyTable,
  layer: CacheLayer<S, N>,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  skip_waiting_on_install: bool,
}

impl<S: CacheStorage, N: Network> Worker<S, N> {
  pub fn new(config: &Config, storage: Arc<S>, network: Arc<N>) -> Result<Self> {
    let origin = &config.origin;
    let site_root = origin
      .join("/")
      .map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;

    let seed = config
      .cache
      .seed
      .iter()
      .map(|path| {
        let url = origin
          .join(path)
          .map_err(|e| eyre!("Invalid seed path {}: {}", path, e))?;
        if url.origin() != origin.origin() {
          return Err(eyre!("Seed URL {} is not on {}", url, origin));
        }
        Ok(url)
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self {
      version: config.cache.version.clone(),
      prefix: config.cache.prefix.clone(),
      site_root,
      seed,
      table: StrategyTable::from_config(origin, &config.routing),
      layer: CacheLayer::new(storage, network, config.bucket_name()),
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
      skip_waiting_on_install: config.cache.skip_waiting_on_install,
    })
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn bucket(&self) -> &str {
    self.layer.bucket()
  }

  pub fn state(&self) -> WorkerState {
    self.state.lock().map(|s| *s).unwrap_or(WorkerState::Redundant)
  }

  fn set_state(&self, state: WorkerState) {
    if let Ok(mut current) = self.state.lock() {
      debug!(version = %self.version, from = ?*current, to = ?state, "worker state");
      *current = state;
    }
  }

  pub fn mark_redundant(&self) {
    self.set_state(WorkerState::Redundant);
  }

  /// Whether the worker asked to skip the waiting period.
  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  pub fn request_skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  /// Open this version's bucket and store the seed manifest.
  ///
  /// Any seed that fails to fetch (or is not 2xx) fails the whole install
  /// and leaves the worker redundant.
  pub async fn install(&self) -> Result<()> {
    self.set_state(WorkerState::Installing);

    match self.seed_bucket().await {
      Ok(()) => {
        info!(version = %self.version, bucket = %self.bucket(), seeds = self.seed.len(), "installed");
        if self.skip_waiting_on_install {
          self.request_skip_waiting();
        }
        self.set_state(WorkerState::Installed);
        Ok(())
      }
      Err(err) => {
        warn!(version = %self.version, error = %err, "install failed");
        self.mark_redundant();
        Err(err)
      }
    }
  }

  /// Delete every other bucket under this worker's prefix.
  ///
  /// Returns the names of the deleted buckets.
  pub async fn activate(&self) -> Result<Vec<String>> {
    self.set_state(WorkerState::Activating);

    let scope = format!("{}-", self.prefix);
    let stale: Vec<String> = self
      .layer
      .storage()
      .bucket_names()?
      .into_iter()
      .filter(|name| name.starts_with(&scope) && name != self.bucket())
      .collect();

    for name in &stale {
      self.layer.storage().delete_bucket(name)?;
      info!(bucket = %name, "deleted old cache");
    }

    self.layer.storage().mark_activated(self.bucket())?;
    self.set_state(WorkerState::Activated);
    Ok(stale)
  }

  /// Pick up a version activated by an earlier run.
  ///
  /// Returns `false` when this version never got activated, including a
  /// version that failed to install or was left waiting. A resumed worker
  /// runs activation again, so buckets left by other versions are dropped.
  pub async fn resume(&self) -> Result<bool> {
    if !self.layer.storage().is_activated(self.bucket())? {
      return Ok(false);
    }

    self.activate().await?;
    Ok(true)
  }

  /// Wait for cache writes the response path did not wait for.
  pub async fn settle(&self) {
    self.layer.settle().await;
  }

  /// Serve an intercepted request.
  ///
  /// `Ok(None)` means the worker does not handle the request and the caller
  /// should go to the network itself.
  pub async fn handle_fetch(&self, request: &Request) -> Result<Option<CacheResult<Response>>> {
    let strategy = self.table.select(request);
    debug!(url = %request.url, ?strategy, "fetch");

    let result = match strategy {
      Strategy::Bypass => return Ok(None),
      Strategy::ForceRefresh => self.layer.force_refresh(request).await,
      Strategy::Image(ImagePolicy::NetworkFirst) => self.layer.image_network_first(request).await,
      Strategy::Image(ImagePolicy::CacheFirst) => self.layer.image_cache_first(request).await,
      Strategy::NetworkFirst => {
        self
          .layer
          .network_first(request, Some(&self.site_root))
          .await
      }
      Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(request).await,
      Strategy::CacheFirst => self.layer.cache_first(request).await,
    };

    result.map(Some)
  }

  /// Drop the bucket, then recreate and reseed it.
  ///
  /// Never fails; the outcome is the reply sent back to the page.
  pub async fn clear_cache(&self) -> WorkerReply {
    match self.layer.storage().delete_bucket(self.bucket()) {
      Ok(existed) => {
        debug!(bucket = %self.bucket(), existed, "cache deleted");
      }
      Err(err) => {
        warn!(bucket = %self.bucket(), error = %err, "cache clear failed");
        return WorkerReply::clear_failed(err.to_string());
      }
    }

    let reseeded = self.seed_bucket().await.and_then(|()| {
      if self.state() == WorkerState::Activated {
        self.layer.storage().mark_activated(self.bucket())?;
      }
      Ok(())
    });

    match reseeded {
      Ok(()) => {
        info!(bucket = %self.bucket(), "cache cleared and reseeded");
        WorkerReply::cleared()
      }
      Err(err) => {
        warn!(bucket = %self.bucket(), error = %err, "reseed failed");
        WorkerReply::clear_failed(err.to_string())
      }
    }
  }

  /// Fetch every seed, then store them in one transaction. The bucket only
  /// comes into existence once all seeds are in hand.
  async fn seed_bucket(&self) -> Result<()> {
    let storage = self.layer.storage();
    let network = self.layer.network();
    let entries = try_join_all(self.seed.iter().map(|url| async move {
      let response = network.fetch(&Request::get(url.clone())).await?;
      if !response.is_ok() {
        return Err(eyre!("Seed {} returned status {}", url, response.status));
      }
      Ok::<_, color_eyre::Report>((url.clone(), response))
    }))
    .await?;

    storage.put_all(self.bucket(), &entries)
  }
}
