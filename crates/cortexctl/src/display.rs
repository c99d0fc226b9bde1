//! Terminal rendering for cortexctl. ASCII only.

use chrono::Local;
use cortex_common::alert::{Alert, AlertSeverity, AlertStatus};
use cortex_common::health::HealthSnapshot;
use owo_colors::OwoColorize;
use serde_json::Value;

const KEY_WIDTH: usize = 16;

fn kv(key: &str, value: impl std::fmt::Display) -> String {
    format!("  {:width$} {}\n", key, value, width = KEY_WIDTH)
}

fn severity_tag(severity: AlertSeverity) -> String {
    let tag = format!("[{}]", severity.as_str().to_uppercase());
    match severity {
        AlertSeverity::Critical => tag.bright_red().bold().to_string(),
        AlertSeverity::Error => tag.red().to_string(),
        AlertSeverity::Warning => tag.yellow().to_string(),
        AlertSeverity::Info => tag.cyan().to_string(),
    }
}

/// Colour a usage percentage by how close it is to full
fn usage(percent: f64) -> String {
    let text = format!("{:.1}%", percent);
    if percent >= 90.0 {
        text.bright_red().to_string()
    } else if percent >= 75.0 {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

fn gib(bytes: u64) -> String {
    format!("{:.1} GiB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

pub fn format_health(h: &HealthSnapshot) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "System health".bold()));

    if !h.is_populated() {
        out.push_str(&format!("  {}\n", "No sample yet, first check still running".dimmed()));
        return out;
    }

    out.push_str(&kv(
        "cpu",
        format!("{} of {} cores", usage(h.cpu_usage_percent), h.cpu_cores),
    ));
    out.push_str(&kv(
        "load",
        format!(
            "{:.2} {:.2} {:.2}",
            h.load_average.one, h.load_average.five, h.load_average.fifteen
        ),
    ));
    out.push_str(&kv(
        "memory",
        format!(
            "{} ({} / {})",
            usage(h.memory_usage_percent),
            gib(h.memory_used_bytes),
            gib(h.memory_total_bytes)
        ),
    ));
    out.push_str(&kv(
        "disk",
        format!(
            "{} ({} / {} on {})",
            usage(h.disk_usage_percent),
            gib(h.disk_used_bytes),
            gib(h.disk_total_bytes),
            h.disk_mount
        ),
    ));
    out.push_str(&kv(
        "updates",
        format!("{} pending, {} security", h.pending_updates, h.security_updates),
    ));

    let alerts = if h.critical_alerts > 0 {
        format!("{} open, {} critical", h.active_alerts, h.critical_alerts.bright_red())
    } else {
        format!("{} open", h.active_alerts)
    };
    out.push_str(&kv("alerts", alerts));

    let sampled = chrono::DateTime::from_timestamp(h.timestamp, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    out.push_str(&kv("sampled", format!("{} (cycle {})", sampled, h.cycle)));
    out
}

pub fn format_alert(alert: &Alert) -> String {
    let mut out = String::new();
    let marker = if alert.is_ai_enhanced() { " [AI]" } else { "" };
    let status = match alert.status {
        AlertStatus::Active => String::new(),
        other => format!(" ({})", other.as_str()).dimmed().to_string(),
    };

    out.push_str(&format!(
        "{} {}{}{}\n",
        severity_tag(alert.severity),
        alert.message,
        marker.magenta(),
        status
    ));
    out.push_str(&format!(
        "    {} {} | {} | {}\n",
        "id".dimmed(),
        alert.id,
        alert.category,
        alert
            .created_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S")
    ));
    if let Some(parent) = alert.parent_id() {
        out.push_str(&format!("    {} {}\n", "analysis of".dimmed(), parent));
    }
    for line in alert.description.lines().filter(|l| !l.trim().is_empty()) {
        out.push_str(&format!("    {}\n", line));
    }
    out
}

pub fn format_alerts(alerts: &[Alert]) -> String {
    if alerts.is_empty() {
        return format!("{}\n", "No alerts".green());
    }
    let mut out = String::new();
    for alert in alerts {
        out.push_str(&format_alert(alert));
    }
    out.push_str(&format!("{}\n", format!("{} alerts", alerts.len()).dimmed()));
    out
}

/// `alerts.counts` result
pub fn format_counts(counts: &Value) -> String {
    let n = |key: &str| counts.get(key).and_then(Value::as_u64).unwrap_or(0);
    let mut out = String::new();
    for severity in AlertSeverity::ALL.iter().rev() {
        out.push_str(&kv(severity.as_str(), n(severity.as_str())));
    }
    out.push_str(&kv("total", n("total")));
    out.push_str(&kv("active", n("active")));
    out.push_str(&kv("acknowledged", n("acknowledged")));
    out
}

pub fn print_ok(message: &str) {
    println!("{} {}", "[OK]".bright_green(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".bright_red(), message);
}

pub fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}
