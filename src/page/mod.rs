//! Page-side glue: registering the worker, update prompts, cache clearing,
//! and the content staleness gate.

pub mod clear;
pub mod staleness;
pub mod update;

pub use clear::clear_cache;
pub use staleness::{StalenessChecker, SystemClock};
pub use update::{registration_url, PageHost, UpdateNotifier};
