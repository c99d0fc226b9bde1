//! Cortex Common - Shared types for the cortexd daemon and the cortexctl client
//!
//! Everything that crosses the Unix socket lives here: the request/response
//! codec, alert and health types, and the default filesystem locations.

pub mod alert;
pub mod health;
pub mod paths;
pub mod protocol;

pub use alert::*;
pub use health::*;
pub use protocol::{ErrorBody, ErrorCode, Outcome, ParseError, Request, Response};

/// Daemon name reported by the `version` method
pub const NAME: &str = "cortexd";

/// Crate version shared by daemon and client
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
