//! Registration: which worker version controls the page, and which waits.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::lifecycle::{Worker, WorkerState};
use crate::cache::{CacheResult, CacheStorage};
use crate::net::{Network, Request, Response};

/// Lifecycle notifications delivered to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
  /// A version finished installing.
  Installed {
    version: String,
    /// Another version was already controlling the page
    has_controller: bool,
    /// The new version is parked until someone calls skip-waiting
    waiting: bool,
  },
  Activated {
    version: String,
  },
  /// A newly activated version claimed the open pages.
  ControllerChanged {
    version: String,
  },
}

struct Slots<S: CacheStorage, N: Network> {
  active: Option<Arc<Worker<S, N>>>,
  waiting: Option<Arc<Worker<S, N>>>,
}

pub struct Registration<S: CacheStorage, N: Network> {
  slots: Mutex<Slots<S, N>>,
  network: Arc<N>,
  events: broadcast::Sender<LifecycleEvent>,
}

impl<S: CacheStorage, N: Network> Registration<S, N> {
  /// `network` serves requests no worker intercepts.
  pub fn new(network: Arc<N>) -> Self {
    let (events, _) = broadcast::channel(16);
    Self {
      slots: Mutex::new(Slots {
        active: None,
        waiting: None,
      }),
      network,
      events,
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
    self.events.subscribe()
  }

  pub async fn active(&self) -> Option<Arc<Worker<S, N>>> {
    self.slots.lock().await.active.clone()
  }

  pub async fn waiting(&self) -> Option<Arc<Worker<S, N>>> {
    self.slots.lock().await.waiting.clone()
  }

  /// Install a worker version.
  ///
  /// With no controller (first visit) the worker activates and claims right
  /// away. Otherwise it waits unless it asked to skip waiting. Any worker
  /// that was already waiting is superseded. The current controller keeps
  /// serving while the new version installs.
  pub async fn register(&self, worker: Worker<S, N>) -> Result<WorkerState> {
    let worker = Arc::new(worker);
    worker.install().await?;

    let mut slots = self.slots.lock().await;
    let has_controller = slots.active.is_some();
    let waits = has_controller && !worker.skip_waiting_requested();

    self.emit(LifecycleEvent::Installed {
      version: worker.version().to_string(),
      has_controller,
      waiting: waits,
    });

    if waits {
      info!(version = %worker.version(), "installed, waiting for skip-waiting");
      if let Some(previous) = slots.waiting.replace(Arc::clone(&worker)) {
        previous.mark_redundant();
      }
    } else {
      self.promote(&mut slots, Arc::clone(&worker)).await?;
    }

    Ok(worker.state())
  }

  /// Make an already-activated version the controller without reinstalling.
  ///
  /// Returns `false` (and changes nothing) if the version was never
  /// activated. No lifecycle events are emitted.
  pub async fn resume(&self, worker: Worker<S, N>) -> Result<bool> {
    if !worker.resume().await? {
      return Ok(false);
    }

    let mut slots = self.slots.lock().await;
    if let Some(previous) = slots.active.replace(Arc::new(worker)) {
      previous.mark_redundant();
    }
    Ok(true)
  }

  /// Activate the waiting worker, if any. Returns whether one was promoted.
  pub async fn skip_waiting(&self) -> Result<bool> {
    let mut slots = self.slots.lock().await;
    match slots.waiting.take() {
      Some(worker) => {
        worker.request_skip_waiting();
        self.promote(&mut slots, worker).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  /// Route a page request through the controlling worker.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    if let Some(worker) = self.active().await {
      if let Some(result) = worker.handle_fetch(request).await? {
        return Ok(result);
      }
    }

    self
      .network
      .fetch(request)
      .await
      .map(CacheResult::from_network)
  }

  async fn promote(&self, slots: &mut Slots<S, N>, worker: Arc<Worker<S, N>>) -> Result<()> {
    if let Err(err) = worker.activate().await {
      warn!(version = %worker.version(), error = %err, "activation failed");
      worker.mark_redundant();
      return Err(err);
    }

    let version = worker.version().to_string();
    if let Some(previous) = slots.active.replace(worker) {
      previous.mark_redundant();
    }

    info!(%version, "activated and claimed clients");
    self.emit(LifecycleEvent::Activated {
      version: version.clone(),
    });
    self.emit(LifecycleEvent::ControllerChanged { version });
    Ok(())
  }

  fn emit(&self, event: LifecycleEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::config::Config;
  use crate::net::mock::MockNetwork;
  use url::Url;

  const ORIGIN: &str = "https://folio.example";

  fn url(path: &str) -> Url {
    Url::parse(ORIGIN).unwrap().join(path).unwrap()
  }

  struct Site {
    storage: Arc<SqliteStorage>,
    network: Arc<MockNetwork>,
    registration: Registration<SqliteStorage, MockNetwork>,
  }

  impl Site {
    fn new() -> Self {
      let network = Arc::new(MockNetwork::new());
      network.respond(url("/").as_str(), 200, "root");
      network.respond(url("/index.html").as_str(), 200, "index");
      Self {
        storage: Arc::new(SqliteStorage::open_in_memory().unwrap()),
        registration: Registration::new(Arc::clone(&network)),
        network,
      }
    }

    fn worker(&self, version: &str) -> Worker<SqliteStorage, MockNetwork> {
      let mut config = Config::for_origin(Url::parse(ORIGIN).unwrap());
      config.cache.version = version.to_string();
      Worker::new(&config, Arc::clone(&self.storage), Arc::clone(&self.network)).unwrap()
    }
  }

  #[tokio::test]
  async fn test_first_install_activates_without_prompt() {
    let site = Site::new();
    let mut events = site.registration.subscribe();

    let state = site.registration.register(site.worker("v1")).await.unwrap();

    assert_eq!(state, WorkerState::Activated);
    assert_eq!(
      events.recv().await.unwrap(),
      LifecycleEvent::Installed {
        version: "v1".to_string(),
        has_controller: false,
        waiting: false,
      }
    );
    assert!(matches!(events.recv().await.unwrap(), LifecycleEvent::Activated { .. }));
    assert!(matches!(
      events.recv().await.unwrap(),
      LifecycleEvent::ControllerChanged { .. }
    ));
  }

  #[tokio::test]
  async fn test_update_waits_until_skip_waiting() {
    let site = Site::new();
    site.registration.register(site.worker("v1")).await.unwrap();

    let state = site.registration.register(site.worker("v2")).await.unwrap();
    assert_eq!(state, WorkerState::Installed);
    assert_eq!(site.registration.active().await.unwrap().version(), "v1");
    assert_eq!(site.registration.waiting().await.unwrap().version(), "v2");

    // Both buckets live while v2 waits
    assert_eq!(
      site.storage.bucket_names().unwrap(),
      vec!["folio-cache-v1".to_string(), "folio-cache-v2".to_string()]
    );

    assert!(site.registration.skip_waiting().await.unwrap());
    assert_eq!(site.registration.active().await.unwrap().version(), "v2");
    assert!(site.registration.waiting().await.is_none());
    assert_eq!(
      site.storage.bucket_names().unwrap(),
      vec!["folio-cache-v2".to_string()]
    );
  }

  #[tokio::test]
  async fn test_resume_installed_version() {
    let site = Site::new();
    assert!(!site.registration.resume(site.worker("v1")).await.unwrap());
    assert!(site.registration.active().await.is_none());

    site.storage.mark_activated("folio-cache-v1").unwrap();
    assert!(site.registration.resume(site.worker("v1")).await.unwrap());
    assert_eq!(site.registration.active().await.unwrap().version(), "v1");
  }

  #[tokio::test]
  async fn test_skip_waiting_without_waiting_worker() {
    let site = Site::new();
    assert!(!site.registration.skip_waiting().await.unwrap());
  }

  #[tokio::test]
  async fn test_newer_waiting_worker_supersedes_older() {
    let site = Site::new();
    site.registration.register(site.worker("v1")).await.unwrap();
    site.registration.register(site.worker("v2")).await.unwrap();
    let v2 = site.registration.waiting().await.unwrap();

    site.registration.register(site.worker("v3")).await.unwrap();

    assert_eq!(v2.state(), WorkerState::Redundant);
    assert_eq!(site.registration.waiting().await.unwrap().version(), "v3");
  }

  #[tokio::test]
  async fn test_failed_install_keeps_controller() {
    let site = Site::new();
    site.registration.register(site.worker("v1")).await.unwrap();
    site.network.fail(url("/index.html").as_str());

    assert!(site.registration.register(site.worker("v2")).await.is_err());
    assert_eq!(site.registration.active().await.unwrap().version(), "v1");
    assert!(site.registration.waiting().await.is_none());
  }

  #[tokio::test]
  async fn test_failed_install_is_not_resumed_later() {
    let site = Site::new();
    site.registration.register(site.worker("v1")).await.unwrap();
    site.network.fail(url("/index.html").as_str());
    assert!(site.registration.register(site.worker("v2")).await.is_err());

    // A later run starts from an empty registration
    let next = Registration::new(Arc::clone(&site.network));
    assert!(!next.resume(site.worker("v2")).await.unwrap());
    assert!(next.active().await.is_none());
    assert!(next.resume(site.worker("v1")).await.unwrap());
    assert_eq!(
      site.storage.bucket_names().unwrap(),
      vec!["folio-cache-v1".to_string()]
    );

    site.network.set_offline(true);
    let result = next.fetch(&Request::navigate(url("/about"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data.body, b"root");
  }

  #[tokio::test]
  async fn test_waiting_version_is_not_resumed_later() {
    let site = Site::new();
    site.registration.register(site.worker("v1")).await.unwrap();
    site.registration.register(site.worker("v2")).await.unwrap();

    let next = Registration::new(Arc::clone(&site.network));
    assert!(!next.resume(site.worker("v2")).await.unwrap());
    assert!(next.resume(site.worker("v1")).await.unwrap());
    assert_eq!(next.active().await.unwrap().version(), "v1");
  }

  #[tokio::test]
  async fn test_fetch_without_controller_goes_to_network() {
    let site = Site::new();
    site.network.respond(url("/data.json").as_str(), 200, "{}");

    let result = site
      .registration
      .fetch(&Request::get(url("/data.json")))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(site.storage.bucket_names().unwrap().len(), 0);
  }

  #[tokio::test]
  async fn test_cross_origin_passes_through_controller() {
    let site = Site::new();
    site.registration.register(site.worker("v1")).await.unwrap();
    let cdn = Url::parse("https://cdn.example.net/lib.js").unwrap();
    site.network.respond(cdn.as_str(), 200, "lib");

    let result = site.registration.fetch(&Request::get(cdn.clone())).await.unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert!(site.storage.get("folio-cache-v1", &cdn).unwrap().is_none());

    site.network.set_offline(true);
    assert!(site.registration.fetch(&Request::get(cdn)).await.is_err());
  }
}
