//! Process-wide tracing subscriber with a reloadable severity floor.
//!
//! `RUST_LOG` wins at startup. After that, `config.reload` can move the
//! floor through the handle returned by [`init`].

use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" | "warning" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Handle for changing the log floor after startup
#[derive(Clone)]
pub struct LogHandle {
    inner: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogHandle {
    /// A handle that changes nothing, for when another subscriber is installed
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Returns false when no reloadable subscriber is installed
    pub fn set_level(&self, level: LogLevel) -> bool {
        let Some(handle) = &self.inner else {
            return false;
        };
        match handle.reload(EnvFilter::new(level.as_str())) {
            Ok(()) => true,
            Err(e) => {
                warn!("[LOG] Failed to change log level: {}", e);
                false
            }
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// get a disabled handle.
pub fn init(level: LogLevel) -> LogHandle {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let (filter_layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(false))
        .try_init();

    match installed {
        Ok(()) => LogHandle {
            inner: Some(handle),
        },
        Err(_) => LogHandle::disabled(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse(" debug "), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }

    #[test]
    fn test_disabled_handle_reports_no_change() {
        assert!(!LogHandle::disabled().set_level(LogLevel::Debug));
    }
}
