//! Messages exchanged between a page and the worker.

use serde::{Deserialize, Serialize};

/// Page -> worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerMessage {
  /// Activate the waiting worker now. No reply.
  SkipWaiting,
  /// Wipe and reseed the current bucket. Replies with `CacheCleared`.
  ClearCache,
}

/// Worker -> page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum WorkerReply {
  CacheCleared {
    status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
  },
}

impl WorkerReply {
  pub fn cleared() -> Self {
    Self::CacheCleared {
      status: true,
      error: None,
    }
  }

  /// Failure reply; the description is never empty.
  pub fn clear_failed(error: impl Into<String>) -> Self {
    let error = error.into();
    let error = if error.trim().is_empty() {
      "cache clear failed".to_string()
    } else {
      error
    };
    Self::CacheCleared {
      status: false,
      error: Some(error),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_message_wire_format() {
    assert_eq!(
      serde_json::to_value(WorkerMessage::SkipWaiting).unwrap(),
      json!({ "action": "skipWaiting" })
    );
    let parsed: WorkerMessage = serde_json::from_value(json!({ "action": "clearCache" })).unwrap();
    assert_eq!(parsed, WorkerMessage::ClearCache);
  }

  #[test]
  fn test_unknown_action_is_rejected() {
    let parsed = serde_json::from_value::<WorkerMessage>(json!({ "type": "clearCache" }));
    assert!(parsed.is_err());
  }

  #[test]
  fn test_reply_wire_format() {
    assert_eq!(
      serde_json::to_value(WorkerReply::cleared()).unwrap(),
      json!({ "action": "cacheCleared", "status": true })
    );
    assert_eq!(
      serde_json::to_value(WorkerReply::clear_failed("disk full")).unwrap(),
      json!({ "action": "cacheCleared", "status": false, "error": "disk full" })
    );
  }

  #[test]
  fn test_failure_reply_always_has_description() {
    let WorkerReply::CacheCleared { status, error } = WorkerReply::clear_failed("  ");
    assert!(!status);
    assert!(!error.unwrap().is_empty());
  }
}
