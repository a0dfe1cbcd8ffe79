//! Scripted network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::{Network, Request, Response};

#[derive(Clone)]
enum Route {
  Respond(Response),
  Fail,
  /// Respond only after the gate is opened
  Gated(Response, Arc<Notify>),
}

#[derive(Default)]
pub struct MockNetwork {
  routes: Mutex<HashMap<String, Route>>,
  offline: AtomicBool,
  calls: Mutex<Vec<String>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self.set(url, Route::Respond(Response::new(status, body)));
  }

  pub fn fail(&self, url: &str) {
    self.set(url, Route::Fail);
  }

  /// The returned handle releases the response with `notify_one`.
  pub fn gate(&self, url: &str, status: u16, body: &str) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self.set(
      url,
      Route::Gated(Response::new(status, body), Arc::clone(&gate)),
    );
    gate
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  fn set(&self, url: &str, route: Route) {
    self.routes.lock().unwrap().insert(url.to_string(), route);
  }
}

impl Network for MockNetwork {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());

    let route = if self.offline.load(Ordering::SeqCst) {
      Some(Route::Fail)
    } else {
      self.routes.lock().unwrap().get(&url).cloned()
    };

    async move {
      match route {
        Some(Route::Respond(response)) => Ok(response),
        Some(Route::Gated(response, gate)) => {
          gate.notified().await;
          Ok(response)
        }
        Some(Route::Fail) => Err(eyre!("network unreachable: {}", url)),
        None => Err(eyre!("no route for {}", url)),
      }
    }
  }
}
