//! Proxy Warden - Proxy Validator and Anonymity Judge
//!
//! Keeps a working set of harvested proxies current: every cycle re-checks the
//! stale ones through an IP-echo service, grades the live ones against a judge
//! page, and syncs the results to durable storage.

pub mod daemon;
pub mod error;
pub mod proxy;

pub use daemon::{Daemon, DaemonConfig};
pub use error::{ProbeError, ProxyError};
pub use proxy::*;

/// Application result type
pub type Result<T> = anyhow::Result<T>;
