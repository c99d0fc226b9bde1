//! Default filesystem locations

/// Socket the daemon listens on
pub const DEFAULT_SOCKET_PATH: &str = "/run/cortex/cortex.sock";

/// Daemon configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cortex/daemon.toml";

/// Alert database
pub const DEFAULT_ALERT_DB_PATH: &str = "/var/lib/cortex/alerts.db";

/// Environment variable overriding the socket path for the client
pub const SOCKET_ENV: &str = "CORTEX_SOCKET";

/// Environment variable overriding the config path for the daemon
pub const CONFIG_ENV: &str = "CORTEXD_CONFIG";

/// Expand a leading `~` to the home directory. Paths without one are returned as-is.
pub fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home.trim_end_matches('/'), &path[1..]);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_home_leaves_absolute_paths() {
        assert_eq!(expand_home("/run/cortex/cortex.sock"), "/run/cortex/cortex.sock");
        assert_eq!(expand_home("relative/~/x"), "relative/~/x");
    }

    #[test]
    fn test_expand_home_prefix() {
        if let Ok(home) = std::env::var("HOME") {
            let expanded = expand_home("~/.cortex/alerts.db");
            assert!(expanded.starts_with(home.trim_end_matches('/')));
            assert!(expanded.ends_with("/.cortex/alerts.db"));
        }
    }
}
