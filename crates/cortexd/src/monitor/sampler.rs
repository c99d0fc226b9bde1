//! Host samplers.
//!
//! `SystemSampler` reads the live machine: `/proc/stat` for CPU counters,
//! sysinfo for memory, disks, core count and load, and the distribution's
//! package tool for pending updates. `FixedSampler` returns scripted values.

use std::io::ErrorKind;
use std::process::Command;
use std::sync::{Arc, Mutex};

use cortex_common::health::LoadAverage;
use sysinfo::{Disks, System};
use tracing::debug;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SampleError {
    #[error("cannot read {0}: {1}")]
    Io(&'static str, String),
    #[error("cannot parse {0}")]
    Parse(&'static str),
    #[error("{0}")]
    Unavailable(String),
}

/// Aggregate CPU jiffies from the first line of /proc/stat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuCounters {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
}

impl CpuCounters {
    pub fn busy(&self) -> u64 {
        self.user + self.nice + self.system
    }

    pub fn total(&self) -> u64 {
        self.busy() + self.idle + self.iowait
    }

    /// Busy share of the interval between two reads, 0-100
    pub fn usage_since(&self, earlier: &CpuCounters) -> f64 {
        let total = self.total().saturating_sub(earlier.total());
        if total == 0 {
            return 0.0;
        }
        let busy = self.busy().saturating_sub(earlier.busy());
        ((busy as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
    }
}

/// Parse the aggregate `cpu` line of /proc/stat
pub fn parse_proc_stat(content: &str) -> Option<CpuCounters> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let mut fields = line.split_whitespace().skip(1).map(|f| f.parse::<u64>());
    let mut next = || fields.next().and_then(Result::ok);
    Some(CpuCounters {
        user: next()?,
        nice: next()?,
        system: next()?,
        idle: next()?,
        iowait: next().unwrap_or(0),
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSample {
    pub mount: String,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCounts {
    pub pending: u32,
    pub security: u32,
}

/// Source of raw host measurements. Each method fails independently.
pub trait Sampler: Send {
    fn cpu_counters(&mut self) -> Result<CpuCounters, SampleError>;
    fn cpu_cores(&mut self) -> usize;
    fn memory(&mut self) -> Result<MemorySample, SampleError>;
    fn disk(&mut self) -> Result<DiskSample, SampleError>;
    fn load_average(&mut self) -> Result<LoadAverage, SampleError>;
    fn updates(&mut self) -> Result<UpdateCounts, SampleError>;
}

/// Live sampler for the local machine
pub struct SystemSampler {
    system: System,
    disks: Disks,
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for SystemSampler {
    fn cpu_counters(&mut self) -> Result<CpuCounters, SampleError> {
        let content = std::fs::read_to_string("/proc/stat")
            .map_err(|e| SampleError::Io("/proc/stat", e.to_string()))?;
        parse_proc_stat(&content).ok_or(SampleError::Parse("/proc/stat"))
    }

    fn cpu_cores(&mut self) -> usize {
        self.system.refresh_cpu();
        let n = self.system.cpus().len();
        if n > 0 {
            n
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    fn memory(&mut self) -> Result<MemorySample, SampleError> {
        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(SampleError::Unavailable("memory totals unavailable".into()));
        }
        Ok(MemorySample {
            used_bytes: self.system.used_memory(),
            total_bytes: total,
        })
    }

    fn disk(&mut self) -> Result<DiskSample, SampleError> {
        self.disks.refresh_list();

        // Root filesystem, else the largest mounted disk
        let disk = self
            .disks
            .list()
            .iter()
            .find(|d| d.mount_point().to_str() == Some("/"))
            .or_else(|| self.disks.list().iter().max_by_key(|d| d.total_space()))
            .ok_or_else(|| SampleError::Unavailable("no mounted disks".into()))?;

        let total = disk.total_space();
        Ok(DiskSample {
            mount: disk.mount_point().display().to_string(),
            used_bytes: total.saturating_sub(disk.available_space()),
            total_bytes: total,
        })
    }

    fn load_average(&mut self) -> Result<LoadAverage, SampleError> {
        let load = System::load_average();
        Ok(LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        })
    }

    fn updates(&mut self) -> Result<UpdateCounts, SampleError> {
        count_updates()
    }
}

fn run(program: &str, args: &[&str]) -> Option<std::io::Result<std::process::Output>> {
    match Command::new(program).args(args).output() {
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        other => Some(other),
    }
}

/// Ask apt, then pacman's checkupdates, then dnf
fn count_updates() -> Result<UpdateCounts, SampleError> {
    if let Some(out) = run("apt", &["list", "--upgradable"]) {
        let out = out.map_err(|e| SampleError::Io("apt", e.to_string()))?;
        debug!("[MONITOR] Counted updates with apt");
        return Ok(parse_apt_upgradable(&String::from_utf8_lossy(&out.stdout)));
    }

    if let Some(out) = run("checkupdates", &[]) {
        let out = out.map_err(|e| SampleError::Io("checkupdates", e.to_string()))?;
        // Exit 2 means nothing to update
        return match out.status.code() {
            Some(0) => Ok(parse_checkupdates(&String::from_utf8_lossy(&out.stdout))),
            Some(2) => Ok(UpdateCounts::default()),
            code => Err(SampleError::Unavailable(format!(
                "checkupdates exited with {:?}",
                code
            ))),
        };
    }

    if let Some(out) = run("dnf", &["check-update", "-q"]) {
        let out = out.map_err(|e| SampleError::Io("dnf", e.to_string()))?;
        // Exit 100 means updates are available
        return match out.status.code() {
            Some(100) => Ok(parse_dnf_check_update(&String::from_utf8_lossy(&out.stdout))),
            Some(0) => Ok(UpdateCounts::default()),
            code => Err(SampleError::Unavailable(format!(
                "dnf check-update exited with {:?}",
                code
            ))),
        };
    }

    Err(SampleError::Unavailable("no supported package manager found".into()))
}

/// `apt list --upgradable` output; security pockets end in `-security`
pub fn parse_apt_upgradable(output: &str) -> UpdateCounts {
    let mut counts = UpdateCounts::default();
    for line in output.lines().filter(|l| l.contains("[upgradable from")) {
        counts.pending += 1;
        let origin = line.split_whitespace().next().unwrap_or("");
        if origin.contains("-security") {
            counts.security += 1;
        }
    }
    counts
}

/// `checkupdates` prints one `name old -> new` line per package
pub fn parse_checkupdates(output: &str) -> UpdateCounts {
    UpdateCounts {
        pending: output.lines().filter(|l| l.contains("->")).count() as u32,
        security: 0,
    }
}

/// `dnf check-update -q` lists `name.arch version repo`, then an optional
/// obsoletes section we skip
pub fn parse_dnf_check_update(output: &str) -> UpdateCounts {
    let mut pending = 0;
    for line in output.lines() {
        if line.starts_with("Obsoleting") {
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() == 3 && fields[0].contains('.') {
            pending += 1;
        }
    }
    UpdateCounts {
        pending,
        security: 0,
    }
}

/// Values returned by [`FixedSampler`]. Usage values are percentages.
#[derive(Debug, Clone, Default)]
pub struct FixedValues {
    pub cpu_percent: f64,
    pub cores: usize,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub load: LoadAverage,
    pub updates: UpdateCounts,
    /// When set, every sampler except the core count fails
    pub failing: bool,
    /// How many times `updates` was asked for
    pub update_calls: usize,
}

/// Scripted sampler. Clones share the same values, so a test can keep one
/// clone as a control handle after handing the other to the monitor. CPU
/// counters advance so that every delta reports `cpu_percent`.
#[derive(Debug, Clone)]
pub struct FixedSampler {
    values: Arc<Mutex<FixedValues>>,
    counters: CpuCounters,
}

const FIXED_TOTAL: u64 = 1 << 30;

impl FixedSampler {
    pub fn new(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            values: Arc::new(Mutex::new(FixedValues {
                cpu_percent,
                cores: 4,
                memory_percent,
                disk_percent,
                ..FixedValues::default()
            })),
            counters: CpuCounters::default(),
        }
    }

    pub fn with_updates(self, pending: u32, security: u32) -> Self {
        self.set(|v| v.updates = UpdateCounts { pending, security });
        self
    }

    /// Change the values seen by every clone
    pub fn set(&self, f: impl FnOnce(&mut FixedValues)) {
        f(&mut self.values.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub fn values(&self) -> FixedValues {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn update_calls(&self) -> usize {
        self.values().update_calls
    }

    fn sample(&self, what: &'static str) -> Result<FixedValues, SampleError> {
        let values = self.values();
        if values.failing {
            Err(SampleError::Unavailable(format!("{} sampler failed", what)))
        } else {
            Ok(values)
        }
    }
}

impl Sampler for FixedSampler {
    fn cpu_counters(&mut self) -> Result<CpuCounters, SampleError> {
        let values = self.sample("cpu")?;
        let busy = (values.cpu_percent.clamp(0.0, 100.0) * 10.0).round() as u64;
        self.counters.user += busy;
        self.counters.idle += 1000 - busy;
        Ok(self.counters)
    }

    fn cpu_cores(&mut self) -> usize {
        self.values().cores
    }

    fn memory(&mut self) -> Result<MemorySample, SampleError> {
        let values = self.sample("memory")?;
        Ok(MemorySample {
            used_bytes: (FIXED_TOTAL as f64 * values.memory_percent / 100.0) as u64,
            total_bytes: FIXED_TOTAL,
        })
    }

    fn disk(&mut self) -> Result<DiskSample, SampleError> {
        let values = self.sample("disk")?;
        Ok(DiskSample {
            mount: "/".to_string(),
            used_bytes: (FIXED_TOTAL as f64 * values.disk_percent / 100.0) as u64,
            total_bytes: FIXED_TOTAL,
        })
    }

    fn load_average(&mut self) -> Result<LoadAverage, SampleError> {
        Ok(self.sample("load")?.load)
    }

    fn updates(&mut self) -> Result<UpdateCounts, SampleError> {
        self.set(|v| v.update_calls += 1);
        Ok(self.sample("updates")?.updates)
    }
}
