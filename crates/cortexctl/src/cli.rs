//! Command-line surface: argument parsing and command dispatch

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cortex_common::alert::{Alert, AlertCategory, AlertSeverity, AlertStatus};
use cortex_common::health::HealthSnapshot;
use cortex_common::protocol::{methods, Request};
use serde_json::{json, Map, Value};

use crate::display;
use crate::rpc_client::RpcClient;

#[derive(Parser, Debug)]
#[command(name = "cortexctl", version, about = "Control the cortexd host health daemon")]
pub struct Cli {
    /// Daemon socket (default: $CORTEX_SOCKET, then /run/cortex/cortex.sock)
    #[arg(long, global = true)]
    pub socket: Option<String>,

    /// Print raw JSON results
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check that the daemon answers
    Ping,
    /// Show daemon and client versions
    Version,
    /// Show the latest health snapshot
    Health,
    /// Run a monitor cycle now
    Check,
    /// List alerts
    Alerts(AlertsArgs),
    /// Acknowledge an alert, or all active alerts
    Ack(TargetArgs),
    /// Dismiss an alert, or all open alerts
    Dismiss(TargetArgs),
    /// Alert counts by severity and status
    Counts,
    /// Show or reload the daemon configuration
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Ask the daemon to exit
    Shutdown,
}

#[derive(Args, Debug, Clone, Default, PartialEq)]
pub struct AlertsArgs {
    #[arg(long)]
    pub severity: Option<AlertSeverity>,
    #[arg(long)]
    pub category: Option<AlertCategory>,
    #[arg(long)]
    pub status: Option<AlertStatus>,
    #[arg(long)]
    pub source: Option<String>,
    /// Include dismissed alerts
    #[arg(long)]
    pub all: bool,
    #[arg(long)]
    pub limit: Option<usize>,
}

#[derive(Args, Debug, Clone, PartialEq)]
pub struct TargetArgs {
    /// Alert id
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub id: Option<String>,
    /// Apply to every matching alert
    #[arg(long)]
    pub all: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ConfigCommand {
    Show,
    Reload,
}

impl TargetArgs {
    fn params(&self) -> Value {
        match &self.id {
            Some(id) if !self.all => json!({"id": id}),
            _ => json!({"all": true}),
        }
    }
}

impl AlertsArgs {
    fn params(&self) -> Value {
        let mut params = Map::new();
        if let Some(s) = self.severity {
            params.insert("severity".into(), json!(s.as_str()));
        }
        if let Some(c) = self.category {
            params.insert("category".into(), json!(c.as_str()));
        }
        if let Some(s) = self.status {
            params.insert("status".into(), json!(s.as_str()));
        }
        if let Some(source) = &self.source {
            params.insert("source".into(), json!(source));
        }
        if self.all {
            params.insert("include_dismissed".into(), json!(true));
        }
        if let Some(limit) = self.limit {
            params.insert("limit".into(), json!(limit));
        }
        Value::Object(params)
    }
}

/// Wire request for a command
pub fn request_for(command: &Command) -> Request {
    match command {
        Command::Ping => Request::new(methods::PING),
        Command::Version => Request::new(methods::VERSION),
        Command::Health => Request::new(methods::HEALTH),
        Command::Check => Request::new(methods::HEALTH_CHECK),
        Command::Alerts(args) => Request::new(methods::ALERTS).with_params(args.params()),
        Command::Ack(t) => Request::new(methods::ALERTS_ACKNOWLEDGE).with_params(t.params()),
        Command::Dismiss(t) => Request::new(methods::ALERTS_DISMISS).with_params(t.params()),
        Command::Counts => Request::new(methods::ALERTS_COUNTS),
        Command::Config(ConfigCommand::Show) => Request::new(methods::CONFIG_GET),
        Command::Config(ConfigCommand::Reload) => Request::new(methods::CONFIG_RELOAD),
        Command::Shutdown => Request::new(methods::SHUTDOWN),
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let client = RpcClient::new(cli.socket.as_deref());
    let request = request_for(&cli.command);
    let result = client.call(&request.method, request.params.clone())?;

    if cli.json {
        display::print_json(&result);
        return Ok(());
    }

    render(&cli.command, &result)
}

fn render(command: &Command, result: &Value) -> Result<()> {
    match command {
        Command::Ping => display::print_ok("cortexd is running"),
        Command::Version => println!(
            "cortexctl {}\ncortexd   {}",
            env!("CARGO_PKG_VERSION"),
            result["version"].as_str().unwrap_or("unknown")
        ),
        Command::Health | Command::Check => {
            let snapshot: HealthSnapshot =
                serde_json::from_value(result.clone()).context("unexpected health payload")?;
            if matches!(command, Command::Check) {
                display::print_ok("Check queued; showing the latest snapshot");
            }
            print!("{}", display::format_health(&snapshot));
        }
        Command::Alerts(_) => {
            let alerts: Vec<Alert> = serde_json::from_value(result["alerts"].clone())
                .context("unexpected alerts payload")?;
            print!("{}", display::format_alerts(&alerts));
        }
        Command::Ack(_) => report_target(result, "acknowledged"),
        Command::Dismiss(_) => report_target(result, "dismissed"),
        Command::Counts => print!("{}", display::format_counts(result)),
        Command::Config(ConfigCommand::Show) => display::print_json(result),
        Command::Config(ConfigCommand::Reload) => display::print_ok("Configuration reloaded"),
        Command::Shutdown => display::print_ok("Shutdown initiated"),
    }
    Ok(())
}

fn report_target(result: &Value, verb: &str) {
    match (&result[verb], result["id"].as_str()) {
        (Value::Bool(true), Some(id)) => display::print_ok(&format!("Alert {} {}", id, verb)),
        (Value::Bool(false), Some(id)) => {
            display::print_error(&format!("Alert {} not found or already {}", id, verb))
        }
        (Value::Number(n), _) => display::print_ok(&format!("{} alerts {}", n, verb)),
        _ => display::print_json(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("cortexctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_alert_filters_become_params() {
        let cli = parse(&["alerts", "--severity", "critical", "--category", "ai-analysis", "--all", "--limit", "5"]);
        let req = request_for(&cli.command);
        assert_eq!(req.method, "alerts");
        assert_eq!(
            req.params,
            json!({"severity": "critical", "category": "ai-analysis", "include_dismissed": true, "limit": 5})
        );
    }

    #[test]
    fn test_bad_severity_rejected_by_parser() {
        assert!(Cli::try_parse_from(["cortexctl", "alerts", "--severity", "meh"]).is_err());
    }

    #[test]
    fn test_ack_and_dismiss_targets() {
        let req = request_for(&parse(&["ack", "abc-123"]).command);
        assert_eq!(req.method, "alerts.acknowledge");
        assert_eq!(req.params, json!({"id": "abc-123"}));

        let req = request_for(&parse(&["dismiss", "--all"]).command);
        assert_eq!(req.method, "alerts.dismiss");
        assert_eq!(req.params, json!({"all": true}));

        assert!(Cli::try_parse_from(["cortexctl", "dismiss"]).is_err());
        assert!(Cli::try_parse_from(["cortexctl", "ack", "x", "--all"]).is_err());
    }

    #[test]
    fn test_version_flag_reports_package_version() {
        let err = Cli::try_parse_from(["cortexctl", "--version"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_global_flags() {
        let cli = parse(&["health", "--json", "--socket", "/tmp/c.sock"]);
        assert!(cli.json);
        assert_eq!(cli.socket.as_deref(), Some("/tmp/c.sock"));
        assert_eq!(request_for(&cli.command).method, "health");
        assert_eq!(request_for(&parse(&["config", "reload"]).command).method, "config.reload");
        assert_eq!(request_for(&parse(&["check"]).command).method, "health.check");
    }
}
