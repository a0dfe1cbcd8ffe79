//! Asking the worker to wipe and reseed its cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::worker::{WorkerHandle, WorkerMessage, WorkerReply};

/// Successful clear-cache round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearOutcome {
  pub cleared_at: DateTime<Utc>,
}

/// Clear the active worker's cache.
///
/// Fails with the worker's error text when it reports failure, and with a
/// timeout error when no reply arrives within `timeout`.
pub async fn clear_cache(worker: &WorkerHandle, timeout: Duration) -> Result<ClearOutcome> {
  match worker.request(WorkerMessage::ClearCache, timeout).await? {
    WorkerReply::CacheCleared { status: true, .. } => Ok(ClearOutcome {
      cleared_at: Utc::now(),
    }),
    WorkerReply::CacheCleared {
      status: false,
      error,
    } => Err(eyre!(
      "Cache clear failed: {}",
      error.unwrap_or_else(|| "unknown error".to_string())
    )),
  }
}
