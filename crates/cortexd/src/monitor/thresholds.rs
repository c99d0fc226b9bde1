//! Threshold evaluation: snapshot + limits -> alert findings

use cortex_common::alert::{Alert, AlertCategory, AlertSeverity};
use cortex_common::health::HealthSnapshot;

use crate::config::ThresholdConfig;

/// Source recorded on every alert the monitor raises
pub const MONITOR_SOURCE: &str = "system_monitor";

/// A crossed threshold, before it becomes a stored alert
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub message: String,
    pub description: String,
    pub metadata: Vec<(String, String)>,
    /// Question put to the inference backend for this condition
    pub prompt: String,
}

impl Finding {
    pub fn to_alert(&self) -> Alert {
        let mut alert = Alert::new(self.severity, self.category, MONITOR_SOURCE, &self.message)
            .with_description(&self.description);
        for (k, v) in &self.metadata {
            alert = alert.with_metadata(k, v);
        }
        alert
    }
}

/// Highest level crossed; thresholds are fractions compared against pct/100
pub fn level(usage_percent: f64, warning: f64, critical: f64) -> Option<AlertSeverity> {
    let fraction = usage_percent / 100.0;
    if fraction >= critical {
        Some(AlertSeverity::Critical)
    } else if fraction >= warning {
        Some(AlertSeverity::Warning)
    } else {
        None
    }
}

fn resource_finding(
    category: AlertCategory,
    label: &str,
    usage_percent: f64,
    warning: f64,
    critical: f64,
    detail: String,
) -> Option<Finding> {
    let severity = level(usage_percent, warning, critical)?;
    let threshold = match severity {
        AlertSeverity::Critical => critical,
        _ => warning,
    };

    Some(Finding {
        severity,
        category,
        message: format!("{} usage {}: {:.1}%", label, severity, usage_percent),
        description: format!(
            "{} usage is {:.1}%, at or above the {} threshold of {:.0}%. {}",
            label,
            usage_percent,
            severity,
            threshold * 100.0,
            detail
        ),
        metadata: vec![
            ("usage_percent".to_string(), format!("{:.1}", usage_percent)),
            ("threshold".to_string(), format!("{:.2}", threshold)),
        ],
        prompt: format!(
            "{} usage on this Linux server is {:.1}% ({}). \
             In 2-3 sentences, name the most likely causes and the commands to investigate them.",
            label, usage_percent, detail
        ),
    })
}

/// Findings for one snapshot. At most one per resource.
pub fn evaluate(snapshot: &HealthSnapshot, limits: &ThresholdConfig) -> Vec<Finding> {
    let mut findings = Vec::new();

    findings.extend(resource_finding(
        AlertCategory::Cpu,
        "CPU",
        snapshot.cpu_usage_percent,
        limits.cpu_warning,
        limits.cpu_critical,
        format!(
            "{} cores, load average {:.2} {:.2} {:.2}",
            snapshot.cpu_cores,
            snapshot.load_average.one,
            snapshot.load_average.five,
            snapshot.load_average.fifteen
        ),
    ));

    findings.extend(resource_finding(
        AlertCategory::Memory,
        "Memory",
        snapshot.memory_usage_percent,
        limits.memory_warning,
        limits.memory_critical,
        format!(
            "{} MiB used of {} MiB",
            snapshot.memory_used_bytes / (1024 * 1024),
            snapshot.memory_total_bytes / (1024 * 1024)
        ),
    ));

    findings.extend(resource_finding(
        AlertCategory::Disk,
        "Disk",
        snapshot.disk_usage_percent,
        limits.disk_warning,
        limits.disk_critical,
        format!(
            "{} GiB used of {} GiB on {}",
            snapshot.disk_used_bytes / (1024 * 1024 * 1024),
            snapshot.disk_total_bytes / (1024 * 1024 * 1024),
            snapshot.disk_mount
        ),
    ));

    if snapshot.security_updates > 0 {
        findings.push(Finding {
            severity: AlertSeverity::Warning,
            category: AlertCategory::Vulnerability,
            message: format!("{} security updates available", snapshot.security_updates),
            description: "Security updates are waiting to be installed.".to_string(),
            metadata: vec![(
                "security_updates".to_string(),
                snapshot.security_updates.to_string(),
            )],
            prompt: format!(
                "A Linux server has {} pending security updates. \
                 In 2-3 sentences, explain the risk of delaying them and how to apply them safely.",
                snapshot.security_updates
            ),
        });
    }

    // Zero pending never alerts, even with a zero threshold
    if snapshot.pending_updates > 0 && snapshot.pending_updates >= limits.pending_updates_warning {
        findings.push(Finding {
            severity: AlertSeverity::Info,
            category: AlertCategory::Packages,
            message: format!("{} package updates available", snapshot.pending_updates),
            description: format!(
                "{} packages can be upgraded ({} security).",
                snapshot.pending_updates, snapshot.security_updates
            ),
            metadata: vec![(
                "pending_updates".to_string(),
                snapshot.pending_updates.to_string(),
            )],
            prompt: format!(
                "A Linux server has {} pending package updates. \
                 In 2-3 sentences, suggest how to review and apply them.",
                snapshot.pending_updates
            ),
        });
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cpu: f64, memory: f64, disk: f64) -> HealthSnapshot {
        HealthSnapshot {
            cpu_usage_percent: cpu,
            memory_usage_percent: memory,
            disk_usage_percent: disk,
            disk_mount: "/".to_string(),
            ..HealthSnapshot::default()
        }
    }

    #[test]
    fn test_level_boundaries_are_inclusive() {
        assert_eq!(level(80.0, 0.80, 0.95), Some(AlertSeverity::Warning));
        assert_eq!(level(95.0, 0.80, 0.95), Some(AlertSeverity::Critical));
        assert_eq!(level(79.9, 0.80, 0.95), None);
        assert_eq!(level(0.0, 0.0, 0.0), Some(AlertSeverity::Critical));
    }

    #[test]
    fn test_one_finding_per_resource_at_highest_level() {
        let findings = evaluate(&snapshot(99.0, 10.0, 10.0), &ThresholdConfig::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].severity, AlertSeverity::Critical);
        assert_eq!(findings[0].category, AlertCategory::Cpu);
    }

    #[test]
    fn test_quiet_host_has_no_findings() {
        assert!(evaluate(&snapshot(5.0, 20.0, 30.0), &ThresholdConfig::default()).is_empty());
    }

    #[test]
    fn test_update_findings() {
        let mut s = snapshot(0.0, 0.0, 0.0);
        s.pending_updates = 60;
        s.security_updates = 3;
        let findings = evaluate(&s, &ThresholdConfig::default());

        let vuln = findings
            .iter()
            .find(|f| f.category == AlertCategory::Vulnerability)
            .unwrap();
        assert_eq!(vuln.severity, AlertSeverity::Warning);

        let pkgs = findings
            .iter()
            .find(|f| f.category == AlertCategory::Packages)
            .unwrap();
        assert_eq!(pkgs.severity, AlertSeverity::Info);
    }

    #[test]
    fn test_zero_pending_never_alerts() {
        let limits = ThresholdConfig {
            pending_updates_warning: 0,
            ..ThresholdConfig::default()
        };
        assert!(evaluate(&snapshot(0.0, 0.0, 0.0), &limits).is_empty());
    }

    #[test]
    fn test_finding_to_alert_carries_metadata() {
        let findings = evaluate(&snapshot(10.0, 10.0, 93.0), &ThresholdConfig::default());
        let alert = findings[0].to_alert();
        assert_eq!(alert.source, MONITOR_SOURCE);
        assert_eq!(alert.category, AlertCategory::Disk);
        assert_eq!(alert.severity, AlertSeverity::Critical);
        assert_eq!(alert.metadata.get("usage_percent").map(String::as_str), Some("93.0"));
        assert!(alert.message.starts_with("Disk usage critical"));
    }
}
