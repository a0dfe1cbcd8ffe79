//! Core types shared by cache storage and the strategy layer.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

/// Result of serving a request, including where the response came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh data from the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from the bucket without touching the network first.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// The network failed and the bucket had a copy.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  /// Made up by the worker, e.g. the image placeholder.
  pub fn synthetic(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  Network,
  Cache,
  /// Network unavailable, serving cached data
  Offline,
  Synthetic,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Synthetic => "synthetic",
    };
    f.write_str(s)
  }
}

/// Stable lookup key for a request URL.
///
/// Fragments never reach the server, so they are dropped before hashing.
pub fn request_hash(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_request_hash_ignores_fragment() {
    let a = Url::parse("https://example.org/about.html#work").unwrap();
    let b = Url::parse("https://example.org/about.html").unwrap();
    assert_eq!(request_hash(&a), request_hash(&b));
  }

  #[test]
  fn test_request_hash_keeps_query() {
    let a = Url::parse("https://example.org/app.js?v=1").unwrap();
    let b = Url::parse("https://example.org/app.js?v=2").unwrap();
    assert_ne!(request_hash(&a), request_hash(&b));
    assert_eq!(request_hash(&a).len(), 64);
  }
}
