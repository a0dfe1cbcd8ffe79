//! Time-based gate for content refreshes.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::SqliteStorage;

/// Durable page storage key holding the last refresh time (epoch ms).
pub const LAST_UPDATE_KEY: &str = "lastContentUpdate";

/// Durable string key/value storage owned by the page.
pub trait PageStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>>;
  fn set_item(&self, key: &str, value: &str) -> Result<()>;
}

impl PageStorage for SqliteStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    SqliteStorage::get_item(self, key)
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    SqliteStorage::set_item(self, key, value)
  }
}

impl<T: PageStorage + ?Sized> PageStorage for &T {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    (**self).get_item(key)
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    (**self).set_item(key, value)
  }
}

pub trait Clock {
  fn now(&self) -> DateTime<Utc>;
}

impl<T: Clock + ?Sized> Clock for &T {
  fn now(&self) -> DateTime<Utc> {
    (**self).now()
  }
}

pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

pub struct StalenessChecker<P: PageStorage, C: Clock> {
  storage: P,
  clock: C,
}

impl<P: PageStorage, C: Clock> StalenessChecker<P, C> {
  pub fn new(storage: P, clock: C) -> Self {
    Self { storage, clock }
  }

  /// Last recorded refresh time, if any.
  pub fn last_update(&self) -> Result<Option<i64>> {
    let raw = self.storage.get_item(LAST_UPDATE_KEY)?;
    Ok(raw.map(|value| match value.trim().parse::<i64>() {
      Ok(ms) => ms,
      Err(err) => {
        warn!(%value, error = %err, "unreadable {} value, treating as never", LAST_UPDATE_KEY);
        0
      }
    }))
  }

  /// `true` when more than `interval` has passed since the last refresh.
  ///
  /// Returning `true` records now as the last refresh time; returning
  /// `false` leaves storage untouched. A missing timestamp counts as epoch 0.
  pub fn check_and_update_content(&self, interval: Duration) -> Result<bool> {
    let now = self.clock.now().timestamp_millis();
    let last = self.last_update()?.unwrap_or(0);
    let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);

    if now.saturating_sub(last) > interval_ms {
      self.storage.set_item(LAST_UPDATE_KEY, &now.to_string())?;
      debug!(last, now, "content refresh due");
      Ok(true)
    } else {
      Ok(false)
    }
  }
}
