//! Alert types shared between daemon and client
//!
//! An alert is the durable record of an abnormal condition. Its status only
//! ever moves forward: active -> acknowledged -> dismissed, or straight from
//! active to dismissed.

use chrono::serde::{ts_seconds, ts_seconds_option};
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Metadata key linking an ai-analysis alert to the alert it explains
pub const META_PARENT_ALERT_ID: &str = "parent_alert_id";

/// Metadata key marking alerts produced by the inference backend
pub const META_AI_ENHANCED: &str = "ai_enhanced";

/// Returned when a string does not name a known enum variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Alert severity levels, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub const ALL: [AlertSeverity; 4] = [
        AlertSeverity::Info,
        AlertSeverity::Warning,
        AlertSeverity::Error,
        AlertSeverity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "info",
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(AlertSeverity::Info),
            "warning" | "warn" => Ok(AlertSeverity::Warning),
            "error" => Ok(AlertSeverity::Error),
            "critical" => Ok(AlertSeverity::Critical),
            _ => Err(UnknownVariant {
                kind: "severity",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What part of the system an alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertCategory {
    Cpu,
    Memory,
    Disk,
    Packages,
    Vulnerability,
    Service,
    System,
    AiAnalysis,
}

impl AlertCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertCategory::Cpu => "cpu",
            AlertCategory::Memory => "memory",
            AlertCategory::Disk => "disk",
            AlertCategory::Packages => "packages",
            AlertCategory::Vulnerability => "vulnerability",
            AlertCategory::Service => "service",
            AlertCategory::System => "system",
            AlertCategory::AiAnalysis => "ai-analysis",
        }
    }
}

impl FromStr for AlertCategory {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(AlertCategory::Cpu),
            "memory" => Ok(AlertCategory::Memory),
            "disk" => Ok(AlertCategory::Disk),
            "packages" => Ok(AlertCategory::Packages),
            "vulnerability" => Ok(AlertCategory::Vulnerability),
            "service" => Ok(AlertCategory::Service),
            "system" => Ok(AlertCategory::System),
            "ai-analysis" | "ai_analysis" => Ok(AlertCategory::AiAnalysis),
            _ => Err(UnknownVariant {
                kind: "category",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Dismissed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Dismissed => "dismissed",
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Active, AlertStatus::Acknowledged)
                | (AlertStatus::Active, AlertStatus::Dismissed)
                | (AlertStatus::Acknowledged, AlertStatus::Dismissed)
        )
    }

    /// Active or acknowledged
    pub fn is_open(&self) -> bool {
        !matches!(self, AlertStatus::Dismissed)
    }
}

impl FromStr for AlertStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" | "ack" => Ok(AlertStatus::Acknowledged),
            "dismissed" => Ok(AlertStatus::Dismissed),
            _ => Err(UnknownVariant {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted record of a detected abnormal condition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    /// UUID assigned by the alert store when left empty
    #[serde(default)]
    pub id: String,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub description: String,
    #[serde(with = "ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub status: AlertStatus,
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, with = "ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub dismissed_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// New active alert stamped with the current time (whole seconds)
    pub fn new(
        severity: AlertSeverity,
        category: AlertCategory,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            severity,
            category,
            source: source.into(),
            message: message.into(),
            description: String::new(),
            created_at: now_seconds(),
            metadata: BTreeMap::new(),
            status: AlertStatus::Active,
            acknowledged_at: None,
            dismissed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_ai_enhanced(&self) -> bool {
        self.metadata
            .get(META_AI_ENHANCED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.metadata.get(META_PARENT_ALERT_ID).map(String::as_str)
    }
}

/// Current time truncated to whole seconds, the resolution alerts are stored at
pub fn now_seconds() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Query filter for listing alerts.
///
/// Dismissed alerts are excluded unless `include_dismissed` is set or the
/// filter asks for `status = dismissed` explicitly. A caller that only sets
/// severity or category will therefore never see dismissed rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<AlertSeverity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<AlertCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AlertStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub include_dismissed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl AlertFilter {
    pub fn all() -> Self {
        Self {
            include_dismissed: true,
            ..Self::default()
        }
    }

    /// Whether dismissed rows may appear in the result
    pub fn admits_dismissed(&self) -> bool {
        self.include_dismissed || self.status == Some(AlertStatus::Dismissed)
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        if alert.status == AlertStatus::Dismissed && !self.admits_dismissed() {
            return false;
        }
        if let Some(severity) = self.severity {
            if alert.severity != severity {
                return false;
            }
        }
        if let Some(category) = self.category {
            if alert.category != category {
                return false;
            }
        }
        if let Some(status) = self.status {
            if alert.status != status {
                return false;
            }
        }
        if let Some(ref source) = self.source {
            if &alert.source != source {
                return false;
            }
        }
        true
    }
}

/// Alert totals by severity, over every stored alert regardless of status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCounts {
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub critical: u64,
    pub total: u64,
}

impl AlertCounts {
    pub fn get(&self, severity: AlertSeverity) -> u64 {
        match severity {
            AlertSeverity::Info => self.info,
            AlertSeverity::Warning => self.warning,
            AlertSeverity::Error => self.error,
            AlertSeverity::Critical => self.critical,
        }
    }

    /// Tally a set of alerts the same way the store's counters do
    pub fn tally<'a>(alerts: impl IntoIterator<Item = &'a Alert>) -> Self {
        let mut counts = Self::default();
        for alert in alerts {
            match alert.severity {
                AlertSeverity::Info => counts.info += 1,
                AlertSeverity::Warning => counts.warning += 1,
                AlertSeverity::Error => counts.error += 1,
                AlertSeverity::Critical => counts.critical += 1,
            }
            counts.total += 1;
        }
        counts
    }
}

/// Counts of alerts that are still open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenCounts {
    pub active: u64,
    pub acknowledged: u64,
    /// Open alerts with critical severity
    pub critical: u64,
}
