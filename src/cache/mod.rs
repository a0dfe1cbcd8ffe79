//! Versioned response cache for offline support.
//!
//! This module provides:
//! - Named buckets of request URL -> response snapshot, stored in SQLite
//! - The fetch strategies the worker applies to a bucket
//! - Basic offline mode (serve cached copies when the network is down)

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, CachedEntry, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
