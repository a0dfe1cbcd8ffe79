use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::worker::ImagePolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Site origin the worker serves, e.g. https://jane.example
  pub origin: Url,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub routing: RoutingConfig,
  #[serde(default)]
  pub page: PageConfig,
  #[serde(default)]
  pub network: NetworkConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Bucket names are `<prefix>-<version>`
  pub prefix: String,
  pub version: String,
  /// Same-origin paths stored at install time
  pub seed: Vec<String>,
  /// Activate a newly installed worker without waiting for the page
  pub skip_waiting_on_install: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "folio-cache".to_string(),
      version: "v1".to_string(),
      seed: vec!["/".to_string(), "/index.html".to_string()],
      skip_waiting_on_install: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
  /// Query parameters that force a network fetch
  pub force_refresh_params: Vec<String>,
  pub images: ImagePolicy,
  pub image_extensions: Vec<String>,
  /// Scripts and stylesheets, served stale-while-revalidate
  pub script_extensions: Vec<String>,
}

impl Default for RoutingConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
    Self {
      force_refresh_params: strings(&["forceUpdate", "timestamp", "no_cache", "force_refresh"]),
      images: ImagePolicy::default(),
      image_extensions: strings(&["png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "avif"]),
      script_extensions: strings(&["js", "mjs", "css"]),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PageConfig {
  /// Path of the worker script, registered with a cache-busting parameter
  pub worker_script: String,
  /// Upper bound for a page -> worker request/reply exchange
  pub message_timeout_secs: u64,
  /// Minimum time between content refreshes
  pub content_interval_secs: u64,
}

impl Default for PageConfig {
  fn default() -> Self {
    Self {
      worker_script: "/sw.js".to_string(),
      message_timeout_secs: 10,
      content_interval_secs: 60 * 60,
    }
  }
}

impl PageConfig {
  pub fn message_timeout(&self) -> Duration {
    Duration::from_secs(self.message_timeout_secs)
  }

  pub fn content_interval(&self) -> Duration {
    Duration::from_secs(self.content_interval_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self { timeout_secs: 30 }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

impl Config {
  /// Defaults for everything but the origin.
  #[cfg(test)]
  pub fn for_origin(origin: Url) -> Self {
    Self {
      origin,
      cache: CacheConfig::default(),
      routing: RoutingConfig::default(),
      page: PageConfig::default(),
      network: NetworkConfig::default(),
    }
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./folio-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/folio-offline/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/folio-offline/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("folio-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("folio-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.origin.cannot_be_a_base() || self.origin.host().is_none() {
      return Err(eyre!("origin must be an absolute http(s) URL: {}", self.origin));
    }
    if self.cache.prefix.is_empty() || self.cache.version.is_empty() {
      return Err(eyre!("cache.prefix and cache.version must not be empty"));
    }
    Ok(())
  }

  /// Current bucket name.
  pub fn bucket_name(&self) -> String {
    format!("{}-{}", self.cache.prefix, self.cache.version)
  }
}

/// Per-user data directory (cache database, logs).
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("folio-offline"))
}
