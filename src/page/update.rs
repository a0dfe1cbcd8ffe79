//! Worker registration URL and the update prompt/reload flow.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use tracing::{debug, info};
use url::Url;

use crate::worker::{LifecycleEvent, WorkerHandle, WorkerMessage};

pub const UPDATE_PROMPT: &str = "A new version of this site is available. Update now?";

/// The worker script URL with a cache-busting `v=<epoch ms>` parameter,
/// so the registration request itself is never served stale.
pub fn registration_url(origin: &Url, script_path: &str, now: DateTime<Utc>) -> Result<Url> {
  let mut url = origin
    .join(script_path)
    .map_err(|e| eyre!("Invalid worker script path {}: {}", script_path, e))?;

  url
    .query_pairs_mut()
    .append_pair("v", &now.timestamp_millis().to_string());
  Ok(url)
}

/// What the update flow needs from the hosting page.
pub trait PageHost: Send {
  /// Blocking yes/no question to the user.
  fn confirm(&mut self, message: &str) -> bool;

  fn reload(&mut self);
}

/// Turns worker lifecycle events into page behavior.
///
/// - A version installed behind an existing controller prompts the user;
///   accepting posts `skipWaiting`.
/// - The first controller change reloads the page. Later ones are ignored.
pub struct UpdateNotifier<H: PageHost> {
  host: H,
  worker: WorkerHandle,
  skip_posted: bool,
  reloaded: bool,
}

impl<H: PageHost> UpdateNotifier<H> {
  pub fn new(host: H, worker: WorkerHandle) -> Self {
    Self {
      host,
      worker,
      skip_posted: false,
      reloaded: false,
    }
  }

  #[cfg(test)]
  pub fn host(&self) -> &H {
    &self.host
  }

  /// An accepted update has not taken control yet.
  pub fn awaiting_controller(&self) -> bool {
    self.skip_posted && !self.reloaded
  }

  pub fn handle_event(&mut self, event: &LifecycleEvent) -> Result<()> {
    match event {
      LifecycleEvent::Installed {
        version,
        has_controller: true,
        waiting: true,
      } => {
        if self.host.confirm(UPDATE_PROMPT) {
          info!(%version, "update accepted");
          self.worker.post_message(WorkerMessage::SkipWaiting)?;
          self.skip_posted = true;
        } else {
          debug!(%version, "update postponed");
        }
      }
      LifecycleEvent::ControllerChanged { version } => {
        if !self.reloaded {
          self.reloaded = true;
          info!(%version, "controller changed, reloading");
          self.host.reload();
        }
      }
      LifecycleEvent::Activated { version } => debug!(%version, "worker activated"),
      LifecycleEvent::Installed { version, .. } => debug!(%version, "worker installed"),
    }
    Ok(())
  }

  /// Consume events until the registration goes away.
  #[cfg(test)]
  pub async fn run(
    mut self,
    mut events: tokio::sync::broadcast::Receiver<LifecycleEvent>,
  ) -> Result<Self> {
    use tokio::sync::broadcast::error::RecvError;

    loop {
      match events.recv().await {
        Ok(event) => self.handle_event(&event)?,
        Err(RecvError::Lagged(skipped)) => {
          tracing::warn!(skipped, "missed lifecycle events");
        }
        Err(RecvError::Closed) => return Ok(self),
      }
    }
  }
}
