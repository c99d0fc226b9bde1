//! Configuration management for cortexd.
//!
//! Loads settings from /etc/cortex/daemon.toml (or `--config` / `$CORTEXD_CONFIG`)
//! and publishes them as an immutable `Arc<Config>` snapshot. A reload swaps the
//! snapshot; readers holding the old one are unaffected.

use cortex_common::paths::{expand_home, DEFAULT_ALERT_DB_PATH, DEFAULT_SOCKET_PATH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::logging::LogLevel;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Unix socket server settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,

    /// listen(2) backlog
    #[serde(default = "default_socket_backlog")]
    pub socket_backlog: i32,

    /// Per-connection read/write timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_requests_per_sec")]
    pub max_requests_per_sec: u32,

    /// Group owning the socket. When set the socket is 0660, otherwise 0666.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_group: Option<String>,
}

fn default_socket_path() -> String {
    DEFAULT_SOCKET_PATH.to_string()
}

fn default_socket_backlog() -> i32 {
    16
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_max_requests_per_sec() -> u32 {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            socket_backlog: default_socket_backlog(),
            request_timeout_ms: default_request_timeout_ms(),
            max_requests_per_sec: default_max_requests_per_sec(),
            socket_group: None,
        }
    }
}

/// System monitor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Package updates are counted every Nth cycle (first cycle included)
    #[serde(default = "default_update_check_every")]
    pub update_check_every: u64,

    /// Ceiling on concurrent enrichment threads
    #[serde(default = "default_max_enrichment_tasks")]
    pub max_enrichment_tasks: usize,
}

/// Longest allowed monitor interval, one day
pub const MAX_INTERVAL_SECS: u64 = 86_400;

fn default_interval_secs() -> u64 {
    300
}

fn default_update_check_every() -> u64 {
    5
}

fn default_max_enrichment_tasks() -> usize {
    8
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            update_check_every: default_update_check_every(),
            max_enrichment_tasks: default_max_enrichment_tasks(),
        }
    }
}

/// Alert thresholds. Resource thresholds are fractions in 0..=1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_cpu_warning")]
    pub cpu_warning: f64,
    #[serde(default = "default_cpu_critical")]
    pub cpu_critical: f64,
    #[serde(default = "default_memory_warning")]
    pub memory_warning: f64,
    #[serde(default = "default_memory_critical")]
    pub memory_critical: f64,
    #[serde(default = "default_disk_warning")]
    pub disk_warning: f64,
    #[serde(default = "default_disk_critical")]
    pub disk_critical: f64,
    #[serde(default = "default_pending_updates_warning")]
    pub pending_updates_warning: u32,
}

fn default_cpu_warning() -> f64 {
    0.80
}

fn default_cpu_critical() -> f64 {
    0.95
}

fn default_memory_warning() -> f64 {
    0.85
}

fn default_memory_critical() -> f64 {
    0.95
}

fn default_disk_warning() -> f64 {
    0.80
}

fn default_disk_critical() -> f64 {
    0.90
}

fn default_pending_updates_warning() -> u32 {
    50
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_warning: default_cpu_warning(),
            cpu_critical: default_cpu_critical(),
            memory_warning: default_memory_warning(),
            memory_critical: default_memory_critical(),
            disk_warning: default_disk_warning(),
            disk_critical: default_disk_critical(),
            pending_updates_warning: default_pending_updates_warning(),
        }
    }
}

/// Alert persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Dismissed alerts older than this are purged. 0 keeps them forever.
    #[serde(default)]
    pub retention_days: u32,
}

fn default_db_path() -> String {
    DEFAULT_ALERT_DB_PATH.to_string()
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            retention_days: 0,
        }
    }
}

/// Which inference backend enriches alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    None,
    /// llama.cpp style server exposing `/completion`
    Local,
    Claude,
    #[serde(rename = "openai")]
    OpenAi,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::None => "none",
            BackendKind::Local => "local",
            BackendKind::Claude => "claude",
            BackendKind::OpenAi => "openai",
        }
    }
}

/// Inference backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Base URL. Empty means the backend's public default.
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub model: String,

    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:8085".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    180
}

fn default_max_tokens() -> u32 {
    150
}

fn default_temperature() -> f32 {
    0.3
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::None,
            endpoint: default_llm_endpoint(),
            model: String::new(),
            api_key_env: String::new(),
            timeout_secs: default_llm_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Parse a TOML document, expand `~` in paths and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match Self::load_existing(path) {
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                warn!(
                    "[CONFIG] {} not found, using defaults",
                    path.display()
                );
                let mut config = Config::default();
                config.expand_paths();
                Ok(config)
            }
            other => other,
        }
    }

    /// Load config from a file that must exist
    pub fn load_existing(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        let config = Self::from_toml_str(&content)?;
        info!("[CONFIG] Loaded config from {}", path.display());
        Ok(config)
    }

    fn expand_paths(&mut self) {
        self.server.socket_path = expand_home(&self.server.socket_path);
        self.alerts.db_path = expand_home(&self.alerts.db_path);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.socket_path.trim().is_empty() {
            return Err(ConfigError::Invalid("server.socket_path is empty".into()));
        }
        if self.server.socket_backlog < 1 {
            return Err(ConfigError::Invalid("server.socket_backlog must be >= 1".into()));
        }
        if self.server.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid("server.request_timeout_ms must be > 0".into()));
        }
        if self.server.max_requests_per_sec == 0 {
            return Err(ConfigError::Invalid("server.max_requests_per_sec must be > 0".into()));
        }
        if self.monitor.interval_secs == 0 || self.monitor.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::Invalid(format!(
                "monitor.interval_secs must be within 1..={}",
                MAX_INTERVAL_SECS
            )));
        }
        if self.monitor.update_check_every == 0 {
            return Err(ConfigError::Invalid("monitor.update_check_every must be > 0".into()));
        }
        if self.alerts.db_path.trim().is_empty() {
            return Err(ConfigError::Invalid("alerts.db_path is empty".into()));
        }

        let t = &self.thresholds;
        for (name, value) in [
            ("cpu_warning", t.cpu_warning),
            ("cpu_critical", t.cpu_critical),
            ("memory_warning", t.memory_warning),
            ("memory_critical", t.memory_critical),
            ("disk_warning", t.disk_warning),
            ("disk_critical", t.disk_critical),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{} must be within 0.0..=1.0, got {}",
                    name, value
                )));
            }
        }
        for (resource, warning, critical) in [
            ("cpu", t.cpu_warning, t.cpu_critical),
            ("memory", t.memory_warning, t.memory_critical),
            ("disk", t.disk_warning, t.disk_critical),
        ] {
            if warning > critical {
                return Err(ConfigError::Invalid(format!(
                    "thresholds.{}_warning exceeds {}_critical",
                    resource, resource
                )));
            }
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::Invalid("llm.temperature must be within 0.0..=2.0".into()));
        }
        if self.llm.max_tokens == 0 {
            return Err(ConfigError::Invalid("llm.max_tokens must be > 0".into()));
        }

        if LogLevel::parse(&self.log.level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "log.level '{}' is not one of trace, debug, info, warn, error",
                self.log.level
            )));
        }

        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::parse(&self.log.level).unwrap_or_default()
    }
}

/// Holds the current config snapshot and knows where to reload it from
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Store with no backing file; `reload` keeps the given config
    pub fn from_config(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the file and swap the snapshot. On error the old snapshot stays.
    /// Unlike the first load, a missing file is an error here.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(self.get()),
        };

        let fresh = Arc::new(Config::load_existing(path)?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        info!("[CONFIG] Reloaded from {}", path.display());
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.socket_path, "/run/cortex/cortex.sock");
        assert_eq!(config.server.socket_backlog, 16);
        assert_eq!(config.server.request_timeout_ms, 5000);
        assert_eq!(config.server.max_requests_per_sec, 100);
        assert_eq!(config.monitor.interval_secs, 300);
        assert_eq!(config.monitor.update_check_every, 5);
        assert_eq!(config.alerts.db_path, "/var/lib/cortex/alerts.db");
        assert_eq!(config.llm.backend, BackendKind::None);
        assert_eq!(config.llm.max_tokens, 150);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[server]
socket_path = "/tmp/cortex-test.sock"
max_requests_per_sec = 5
socket_group = "cortex"

[thresholds]
cpu_warning = 0.5

[llm]
backend = "openai"
model = "gpt-4o-mini"
api_key_env = "OPENAI_API_KEY"
"#;
        let config = Config::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.socket_path, "/tmp/cortex-test.sock");
        assert_eq!(config.server.max_requests_per_sec, 5);
        assert_eq!(config.server.socket_group.as_deref(), Some("cortex"));
        assert_eq!(config.thresholds.cpu_warning, 0.5);
        assert_eq!(config.llm.backend, BackendKind::OpenAi);
        // Defaults for missing fields
        assert_eq!(config.server.socket_backlog, 16);
        assert_eq!(config.thresholds.cpu_critical, 0.95);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_rejects_out_of_range_threshold() {
        let err = Config::from_toml_str("[thresholds]\ndisk_critical = 1.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_warning_above_critical() {
        let err = Config::from_toml_str(
            "[thresholds]\nmemory_warning = 0.9\nmemory_critical = 0.8\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("memory_warning"));
    }

    #[test]
    fn test_zero_thresholds_are_valid() {
        let config = Config::from_toml_str(
            "[thresholds]\ncpu_warning = 0.0\ncpu_critical = 0.0\n",
        )
        .unwrap();
        assert_eq!(config.thresholds.cpu_critical, 0.0);
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let err = Config::from_toml_str("[log]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::from_toml_str("[server\nsocket_path = 1").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(store.get().server.max_requests_per_sec, 100);
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[server]\nmax_requests_per_sec = 10\n").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let before = store.get();
        assert_eq!(before.server.max_requests_per_sec, 10);

        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "[server]\nmax_requests_per_sec = 20").unwrap();
        drop(f);

        let after = store.reload().unwrap();
        assert_eq!(after.server.max_requests_per_sec, 20);
        assert_eq!(store.get().server.max_requests_per_sec, 20);
        // Old snapshot is untouched
        assert_eq!(before.server.max_requests_per_sec, 10);
    }

    #[test]
    fn test_failed_reload_keeps_old_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(&path, "[monitor]\ninterval_secs = 60\n").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        fs::write(&path, "[monitor\ninterval_secs = ").unwrap();

        assert!(store.reload().is_err());
        assert_eq!(store.get().monitor.interval_secs, 60);
    }

    #[test]
    fn test_reload_of_deleted_file_keeps_old_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        fs::write(
            &path,
            "[server]\nmax_requests_per_sec = 7\n\n[thresholds]\ncpu_warning = 0.4\ncpu_critical = 0.5\n",
        )
        .unwrap();

        let store = ConfigStore::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        let err = store.reload().unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert_eq!(store.get().server.max_requests_per_sec, 7);
        assert_eq!(store.get().thresholds.cpu_critical, 0.5);
    }

    #[test]
    fn test_interval_bounds() {
        assert!(Config::from_toml_str("[monitor]\ninterval_secs = 0\n").is_err());
        let huge = format!("[monitor]\ninterval_secs = {}\n", i64::MAX);
        let err = Config::from_toml_str(&huge).unwrap_err();
        assert!(err.to_string().contains("monitor.interval_secs"));
        let max = format!("[monitor]\ninterval_secs = {}\n", MAX_INTERVAL_SECS);
        assert!(Config::from_toml_str(&max).is_ok());
    }

    #[test]
    fn test_from_config_reload_is_noop() {
        let mut config = Config::default();
        config.monitor.interval_secs = 7;
        let store = ConfigStore::from_config(config);
        assert!(store.path().is_none());
        assert_eq!(store.reload().unwrap().monitor.interval_secs, 7);
    }
}
