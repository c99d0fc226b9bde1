//! Health snapshot produced once per monitor cycle

use serde::{Deserialize, Serialize};

/// 1, 5 and 15 minute load averages
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

/// Point-in-time view of host health. Percentages are 0-100.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Epoch seconds when the snapshot was taken
    pub timestamp: i64,
    pub cpu_usage_percent: f64,
    pub cpu_cores: usize,
    pub load_average: LoadAverage,
    pub memory_usage_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub disk_usage_percent: f64,
    pub disk_used_bytes: u64,
    pub disk_total_bytes: u64,
    pub disk_mount: String,
    pub pending_updates: u32,
    pub security_updates: u32,
    pub active_alerts: u64,
    pub critical_alerts: u64,
    /// Monitor cycle that produced this snapshot, starting at 1
    pub cycle: u64,
}

impl HealthSnapshot {
    /// True once the monitor has completed at least one cycle
    pub fn is_populated(&self) -> bool {
        self.cycle > 0
    }
}

/// Usage as a percentage, 0 when the total is unknown
pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}
