//! Cache layer that applies a fetch strategy against one bucket.

use color_eyre::Result;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use super::storage::{CacheStorage, CachedEntry};
use super::traits::CacheResult;
use crate::net::{Network, Request, Response};

/// Cache layer that manages caching logic and network fetching.
///
/// Every strategy reads and writes the single bucket this layer was built
/// for. Storage failures are logged and never fail the response; network
/// failures either fall back to the bucket or are returned to the caller.
///
/// Two handlers fetching the same uncached URL at once both write the entry.
/// The later write wins; each write is a complete snapshot.
pub struct CacheLayer<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  bucket: String,
  /// Writes and revalidations the response path did not wait for
  background: Arc<Mutex<JoinSet<()>>>,
}

impl<S: CacheStorage, N: Network> CacheLayer<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, bucket: impl Into<String>) -> Self {
    Self {
      storage,
      network,
      bucket: bucket.into(),
      background: Arc::new(Mutex::new(JoinSet::new())),
    }
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  /// Cache-first.
  ///
  /// 1. Serve the cached copy if there is one
  /// 2. Otherwise fetch, storing the response only on an exact 200
  pub async fn cache_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    if let Some(entry) = self.lookup(&request.url) {
      debug!(url = %entry.url, "cache hit");
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    let response = self.fetch_logged(request).await?;
    if response.status == 200 {
      self.store(&request.url, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  /// Network-first for documents.
  ///
  /// A successful response is written to the bucket without waiting for the
  /// write. On network failure the cached copy of the URL is served, then the
  /// cached copy of `fallback` (the site root), then the error propagates.
  pub async fn network_first(
    &self,
    request: &Request,
    fallback: Option<&Url>,
  ) -> Result<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.spawn_store(request.url.clone(), response.clone());
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "network failed, trying cache");
        let entry = self
          .lookup(&request.url)
          .or_else(|| fallback.and_then(|root| self.lookup(root)));

        match entry {
          Some(entry) => Ok(CacheResult::offline(entry.response, entry.cached_at)),
          None => Err(err),
        }
      }
    }
  }

  /// Network only, with the cached copy as a last resort.
  ///
  /// Nothing is written to the bucket.
  pub async fn force_refresh(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(err) => {
        warn!(url = %request.url, error = %err, "forced refresh failed, trying cache");
        match self.lookup(&request.url) {
          Some(entry) => Ok(CacheResult::offline(entry.response, entry.cached_at)),
          None => Err(err),
        }
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A cached copy is returned at once while a spawned task fetches a fresh
  /// copy and overwrites the entry. Without a cached copy the fetch is
  /// awaited and its response stored.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<CacheResult<Response>> {
    if let Some(entry) = self.lookup(&request.url) {
      self.spawn_revalidate(request.clone());
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    let response = self.fetch_logged(request).await?;
    if response.is_ok() {
      self.store(&request.url, &response);
    }
    Ok(CacheResult::from_network(response))
  }

  /// Images, network first. Falls back to the cached copy, then to a
  /// placeholder 404.
  pub async fn image_network_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.spawn_store(request.url.clone(), response.clone());
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "image fetch failed, trying cache");
        match self.lookup(&request.url) {
          Some(entry) => Ok(CacheResult::offline(entry.response, entry.cached_at)),
          None => Ok(CacheResult::synthetic(Response::image_unavailable())),
        }
      }
    }
  }

  /// Images, cache first with a background refresh of every hit. A failed
  /// fetch on a miss yields the placeholder 404.
  pub async fn image_cache_first(&self, request: &Request) -> Result<CacheResult<Response>> {
    if let Some(entry) = self.lookup(&request.url) {
      self.spawn_revalidate(request.clone());
      return Ok(CacheResult::from_cache(entry.response, entry.cached_at));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_ok() {
          self.store(&request.url, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(err) => {
        warn!(url = %request.url, error = %err, "image unavailable");
        Ok(CacheResult::synthetic(Response::image_unavailable()))
      }
    }
  }

  async fn fetch_logged(&self, request: &Request) -> Result<Response> {
    self.network.fetch(request).await.map_err(|err| {
      warn!(url = %request.url, error = %err, "fetch failed");
      err
    })
  }

  /// Cache read; a storage error counts as a miss.
  fn lookup(&self, url: &Url) -> Option<CachedEntry> {
    match self.storage.get(&self.bucket, url) {
      Ok(entry) => entry,
      Err(err) => {
        warn!(%url, bucket = %self.bucket, error = %err, "cache read failed");
        None
      }
    }
  }

  fn store(&self, url: &Url, response: &Response) {
    if let Err(err) = self.storage.put(&self.bucket, url, response) {
      warn!(%url, bucket = %self.bucket, error = %err, "cache write failed");
    }
  }

  /// Wait for every background task spawned so far.
  pub async fn settle(&self) {
    let mut pending = match self.background.lock() {
      Ok(mut set) => std::mem::take(&mut *set),
      Err(_) => return,
    };
    while pending.join_next().await.is_some() {}
  }

  fn spawn_background<F>(&self, task: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.background.lock() {
      Ok(mut set) => {
        // Reap finished tasks so the set stays small
        while set.try_join_next().is_some() {}
        set.spawn(task);
      }
      Err(_) => {
        tokio::spawn(task);
      }
    }
  }

  fn spawn_store(&self, url: Url, response: Response) {
    let this = self.clone();
    self.spawn_background(async move {
      this.store(&url, &response);
    });
  }

  fn spawn_revalidate(&self, request: Request) {
    let this = self.clone();
    self.spawn_background(async move {
      match this.network.fetch(&request).await {
        Ok(response) if response.is_ok() => {
          debug!(url = %request.url, "revalidated");
          this.store(&request.url, &response);
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation not stored");
        }
        Err(err) => {
          warn!(url = %request.url, error = %err, "revalidation failed");
        }
      }
    });
  }
}

impl<S: CacheStorage, N: Network> Clone for CacheLayer<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      bucket: self.bucket.clone(),
      background: Arc::clone(&self.background),
    }
  }
}
