//! cortexd - host health daemon
//!
//! Samples CPU, memory, disk, load and pending package updates, raises
//! persistent alerts when thresholds are crossed, optionally enriches them
//! through an inference backend, and answers JSON requests on a Unix socket.

pub mod alert_store;
pub mod config;
pub mod daemon;
pub mod handlers;
pub mod inference;
pub mod logging;
pub mod monitor;
pub mod rate_limiter;
pub mod server;

pub use daemon::{Daemon, DaemonError, DaemonOptions, ShutdownSignal};
