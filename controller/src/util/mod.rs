use std::time::Duration;

pub mod patch;
pub mod messages;

pub(crate) mod colors;

#[cfg(feature = "metrics")]
pub mod metrics;

mod error;

pub use error::*;

/// Default controller loop tick period (spec §4.6).
pub(crate) const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default Validator TTL for consolidation-class decisions (spec §4.4).
pub(crate) const DEFAULT_VALIDATION_TTL: Duration = Duration::from_secs(15);

/// Name of the Kubernetes resource manager used for server-side-apply status patches.
pub(crate) const MANAGER_NAME: &str = "nlm-controller";
