//! Strategy table: which fetch strategy handles which request.

use reqwest::Method;
use serde::Deserialize;
use url::{Origin, Url};

use crate::config::RoutingConfig;
use crate::net::Request;

/// How images are served.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ImagePolicy {
  /// Network first, cached copy on failure
  #[default]
  NetworkFirst,
  /// Cached copy if present, otherwise fetch and store
  CacheFirst,
}

/// What the worker does with an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Not intercepted; the request goes straight to the network
  Bypass,
  /// Network only, cached copy if the network fails
  ForceRefresh,
  Image(ImagePolicy),
  /// Network first; cached copy of the URL or of the site root on failure
  NetworkFirst,
  StaleWhileRevalidate,
  CacheFirst,
}

/// Path predicate of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
  /// Lowercase extensions, without the dot
  Extensions(Vec<String>),
  /// HTML documents and navigation requests
  Document,
  Any,
}

impl PathPattern {
  fn matches(&self, request: &Request) -> bool {
    match self {
      Self::Extensions(exts) => {
        extension(&request.url).is_some_and(|ext| exts.iter().any(|e| *e == ext))
      }
      Self::Document => {
        request.is_navigation()
          || extension(&request.url).is_some_and(|ext| ext == "html" || ext == "htm")
      }
      Self::Any => true,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
  pub pattern: PathPattern,
  pub strategy: Strategy,
}

/// Ordered routing rules for one site. First match wins.
///
/// Method, origin and force-refresh markers are checked before the path
/// rules, so selection depends only on the request.
#[derive(Debug, Clone)]
pub struct StrategyTable {
  origin: Origin,
  force_refresh_params: Vec<String>,
  rules: Vec<Rule>,
}

impl StrategyTable {
  pub fn new(origin: &Url, force_refresh_params: Vec<String>, rules: Vec<Rule>) -> Self {
    Self {
      origin: origin.origin(),
      force_refresh_params,
      rules,
    }
  }

  /// The site's table: images, documents, scripts/styles, then everything else.
  pub fn from_config(origin: &Url, routing: &RoutingConfig) -> Self {
    let lower = |exts: &[String]| -> Vec<String> {
      exts
        .iter()
        .map(|e| e.trim_start_matches('.').to_lowercase())
        .collect()
    };

    let rules = vec![
      Rule {
        pattern: PathPattern::Extensions(lower(&routing.image_extensions)),
        strategy: Strategy::Image(routing.images),
      },
      Rule {
        pattern: PathPattern::Document,
        strategy: Strategy::NetworkFirst,
      },
      Rule {
        pattern: PathPattern::Extensions(lower(&routing.script_extensions)),
        strategy: Strategy::StaleWhileRevalidate,
      },
      Rule {
        pattern: PathPattern::Any,
        strategy: Strategy::CacheFirst,
      },
    ];

    Self::new(origin, routing.force_refresh_params.clone(), rules)
  }

  pub fn select(&self, request: &Request) -> Strategy {
    if request.method != Method::GET {
      return Strategy::Bypass;
    }

    if request.url.origin() != self.origin {
      return Strategy::Bypass;
    }

    let forced = request
      .url
      .query_pairs()
      .any(|(name, _)| self.force_refresh_params.iter().any(|p| *p == name));
    if forced {
      return Strategy::ForceRefresh;
    }

    self
      .rules
      .iter()
      .find(|rule| rule.pattern.matches(request))
      .map(|rule| rule.strategy)
      .unwrap_or(Strategy::Bypass)
  }
}

/// Lowercased extension of the last path segment.
fn extension(url: &Url) -> Option<String> {
  let segment = url.path_segments()?.next_back()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_lowercase())
}
