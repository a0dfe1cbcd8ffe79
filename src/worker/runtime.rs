//! Message loop connecting pages to a registration.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::protocol::{WorkerMessage, WorkerReply};
use super::registration::Registration;
use crate::cache::CacheStorage;
use crate::net::Network;

/// A message plus the port its reply goes to.
pub(crate) struct Envelope {
  pub(crate) message: WorkerMessage,
  pub(crate) reply: Option<oneshot::Sender<WorkerReply>>,
}

/// Page-side handle for posting messages to the worker.
#[derive(Clone)]
pub struct WorkerHandle {
  tx: mpsc::UnboundedSender<Envelope>,
}

impl WorkerHandle {
  /// Fire-and-forget message.
  pub fn post_message(&self, message: WorkerMessage) -> Result<()> {
    self
      .tx
      .send(Envelope {
        message,
        reply: None,
      })
      .map_err(|_| eyre!("Worker is not running"))
  }

  /// Send a message on a fresh reply port and wait at most `timeout`.
  pub async fn request(&self, message: WorkerMessage, timeout: Duration) -> Result<WorkerReply> {
    let (reply_tx, reply_rx) = oneshot::channel();
    self
      .tx
      .send(Envelope {
        message,
        reply: Some(reply_tx),
      })
      .map_err(|_| eyre!("Worker is not running"))?;

    match tokio::time::timeout(timeout, reply_rx).await {
      Ok(Ok(reply)) => Ok(reply),
      Ok(Err(_)) => Err(eyre!("Worker closed the reply port without answering")),
      Err(_) => Err(eyre!("Worker did not reply within {:?}", timeout)),
    }
  }

  /// A handle whose messages are never answered, plus the receiving end.
  #[cfg(test)]
  pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

/// Start the worker's message loop.
///
/// Messages are handled one at a time in arrival order. The loop ends when
/// every handle has been dropped.
pub fn spawn<S: CacheStorage, N: Network>(registration: Arc<Registration<S, N>>) -> WorkerHandle {
  let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

  tokio::spawn(async move {
    while let Some(envelope) = rx.recv().await {
      handle(&registration, envelope).await;
    }
    debug!("worker message loop finished");
  });

  WorkerHandle { tx }
}

async fn handle<S: CacheStorage, N: Network>(
  registration: &Registration<S, N>,
  envelope: Envelope,
) {
  debug!(message = ?envelope.message, "worker message");

  match envelope.message {
    WorkerMessage::SkipWaiting => {
      if let Err(err) = registration.skip_waiting().await {
        warn!(error = %err, "skip-waiting failed");
      }
    }
    WorkerMessage::ClearCache => {
      let reply = match registration.active().await {
        Some(worker) => worker.clear_cache().await,
        None => WorkerReply::clear_failed("No active worker"),
      };

      match envelope.reply {
        Some(port) => {
          if port.send(reply).is_err() {
            debug!("clear-cache reply dropped by page");
          }
        }
        None => debug!("clear-cache sent without a reply port"),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::net::mock::MockNetwork;
  use crate::worker::Worker;
  use url::Url;

  async fn running() -> (
    WorkerHandle,
    Arc<Registration<SqliteStorage, MockNetwork>>,
    Arc<MockNetwork>,
  ) {
    let network = Arc::new(MockNetwork::new());
    network.respond("https://folio.example/", 200, "root");
    network.respond("https://folio.example/index.html", 200, "index");

    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let registration = Arc::new(Registration::new(Arc::clone(&network)));
    let config = Config::for_origin(Url::parse("https://folio.example").unwrap());
    let worker = Worker::new(&config, storage, Arc::clone(&network)).unwrap();
    registration.register(worker).await.unwrap();

    (spawn(Arc::clone(&registration)), registration, network)
  }

  #[tokio::test]
  async fn test_clear_cache_round_trip() {
    let (handle, _registration, _network) = running().await;

    let reply = handle
      .request(WorkerMessage::ClearCache, Duration::from_secs(5))
      .await
      .unwrap();

    assert_eq!(reply, WorkerReply::cleared());
  }

  #[tokio::test]
  async fn test_clear_cache_without_controller_fails() {
    let network = Arc::new(MockNetwork::new());
    let registration: Arc<Registration<SqliteStorage, MockNetwork>> =
      Arc::new(Registration::new(network));
    let handle = spawn(registration);

    let WorkerReply::CacheCleared { status, error } = handle
      .request(WorkerMessage::ClearCache, Duration::from_secs(5))
      .await
      .unwrap();

    assert!(!status);
    assert_eq!(error.as_deref(), Some("No active worker"));
  }

  #[tokio::test]
  async fn test_request_times_out_when_worker_is_silent() {
    let (handle, _rx) = WorkerHandle::detached();

    let err = handle
      .request(WorkerMessage::ClearCache, Duration::from_millis(20))
      .await
      .unwrap_err();

    assert!(err.to_string().contains("did not reply"));
  }

  #[tokio::test]
  async fn test_request_fails_when_worker_is_gone() {
    let (handle, rx) = WorkerHandle::detached();
    drop(rx);

    assert!(handle.post_message(WorkerMessage::SkipWaiting).is_err());
    assert!(handle
      .request(WorkerMessage::ClearCache, Duration::from_secs(1))
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_skip_waiting_message_promotes_waiting_worker() {
    let (handle, registration, network) = running().await;
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let mut config = Config::for_origin(Url::parse("https://folio.example").unwrap());
    config.cache.version = "v2".to_string();
    registration
      .register(Worker::new(&config, storage, network).unwrap())
      .await
      .unwrap();
    assert!(registration.waiting().await.is_some());

    handle.post_message(WorkerMessage::SkipWaiting).unwrap();
    // A reply-bearing message queued behind it completes only after it
    handle
      .request(WorkerMessage::ClearCache, Duration::from_secs(5))
      .await
      .unwrap();

    assert_eq!(registration.active().await.unwrap().version(), "v2");
  }
}
