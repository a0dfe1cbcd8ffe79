//! The offline cache worker.
//!
//! A [`Registration`] holds the controlling worker version and any version
//! waiting to replace it. Each [`Worker`] serves requests through the
//! [`StrategyTable`] against its own versioned bucket, and pages talk to it
//! through a [`WorkerHandle`].

mod lifecycle;
mod protocol;
mod registration;
pub mod runtime;
mod strategy;

pub use lifecycle::Worker;
pub use protocol::{WorkerMessage, WorkerReply};
pub use registration::{LifecycleEvent, Registration};
pub use runtime::WorkerHandle;
pub use strategy::ImagePolicy;
