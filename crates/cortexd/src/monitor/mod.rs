//! System Monitor - periodic health sampling and alerting
//!
//! One cycle runs immediately at start, then every `monitor.interval_secs`
//! or as soon as `trigger_check()` is called. Each cycle:
//! 1. samples CPU, memory, disk, load (and package updates every Nth cycle)
//! 2. publishes a fresh `HealthSnapshot`
//! 3. raises alerts for crossed thresholds, skipping ones already open
//! 4. hands new alerts to background enrichment when a backend is configured
//! 5. reaps finished enrichment threads and, if enabled, purges old dismissed alerts

pub mod enrichment;
pub mod sampler;
pub mod thresholds;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cortex_common::alert::now_seconds;
use cortex_common::health::{percent, HealthSnapshot};
use tracing::{debug, info, warn};

use crate::alert_store::AlertStore;
use crate::config::{Config, ConfigStore, MAX_INTERVAL_SECS};
use crate::inference::{InferenceClient, InferenceRequest};
use enrichment::EnrichmentTask;
use sampler::{CpuCounters, Sampler, SystemSampler};
pub use thresholds::MONITOR_SOURCE;

/// Gap between the two CPU reads of the very first cycle
pub const CPU_PRIME_INTERVAL: Duration = Duration::from_millis(250);

/// Retention sweep runs every this many cycles
pub const RETENTION_SWEEP_EVERY: u64 = 12;

struct CycleState {
    sampler: Box<dyn Sampler>,
    prev_cpu: Option<CpuCounters>,
    /// Cycles completed so far
    cycles: u64,
    /// Last published values, kept when a sampler fails
    last: HealthSnapshot,
}

pub struct SystemMonitor {
    config: Arc<ConfigStore>,
    store: Weak<AlertStore>,
    inference: Option<Arc<dyn InferenceClient>>,
    snapshot: RwLock<HealthSnapshot>,
    state: Mutex<CycleState>,
    tasks: Mutex<Vec<EnrichmentTask>>,
    running: Arc<AtomicBool>,
    check_now: Mutex<bool>,
    wake: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl SystemMonitor {
    pub fn new(
        config: Arc<ConfigStore>,
        store: Weak<AlertStore>,
        inference: Option<Arc<dyn InferenceClient>>,
    ) -> Self {
        Self::with_sampler(config, store, inference, Box::new(SystemSampler::new()))
    }

    pub fn with_sampler(
        config: Arc<ConfigStore>,
        store: Weak<AlertStore>,
        inference: Option<Arc<dyn InferenceClient>>,
        sampler: Box<dyn Sampler>,
    ) -> Self {
        Self {
            config,
            store,
            inference,
            snapshot: RwLock::new(HealthSnapshot::default()),
            state: Mutex::new(CycleState {
                sampler,
                prev_cpu: None,
                cycles: 0,
                last: HealthSnapshot::default(),
            }),
            tasks: Mutex::new(Vec::new()),
            // Enrichment is allowed for synchronous cycles before `start`
            running: Arc::new(AtomicBool::new(true)),
            check_now: Mutex::new(false),
            wake: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    /// Spawn the monitor loop thread
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        let mut slot = lock(&self.thread);
        if slot.is_some() {
            return Ok(());
        }
        self.running.store(true, Ordering::SeqCst);

        let monitor = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("cortexd-monitor".to_string())
            .spawn(move || monitor.run_loop())?;
        *slot = Some(handle);
        info!("[MONITOR] Started");
        Ok(())
    }

    fn run_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.run_cycle();

            let interval = Duration::from_secs(
                self.config
                    .get()
                    .monitor
                    .interval_secs
                    .min(MAX_INTERVAL_SECS),
            );
            let deadline = Instant::now() + interval;
            let mut check_now = lock(&self.check_now);
            while self.running.load(Ordering::SeqCst) && !*check_now {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                check_now = self
                    .wake
                    .wait_timeout(check_now, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|e| e.into_inner().0);
            }
            *check_now = false;
        }
        debug!("[MONITOR] Loop exited");
    }

    /// Ask the loop thread to run a cycle now
    pub fn trigger_check(&self) {
        *lock(&self.check_now) = true;
        self.wake.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && lock(&self.thread).is_some()
    }

    /// Stop the loop and join it plus every enrichment thread. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        {
            let _guard = lock(&self.check_now);
            self.wake.notify_all();
        }

        let handle = lock(&self.thread).take();
        if let Some(handle) = handle.filter(|h| h.thread().id() != thread::current().id()) {
            if handle.join().is_err() {
                warn!("[MONITOR] Loop thread panicked");
            }
        }

        let tasks: Vec<EnrichmentTask> = lock(&self.tasks).drain(..).collect();
        if !tasks.is_empty() {
            info!("[MONITOR] Waiting for {} enrichment tasks", tasks.len());
        }
        for task in tasks {
            task.join();
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> HealthSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Enrichment threads still working
    pub fn pending_enrichments(&self) -> usize {
        lock(&self.tasks).iter().filter(|t| !t.is_done()).count()
    }

    /// Run one full cycle on the calling thread and return its snapshot
    pub fn run_cycle(&self) -> HealthSnapshot {
        let config = self.config.get();
        let mut state = lock(&self.state);
        let index = state.cycles;

        let mut snap = sample(&mut state, index, &config);
        state.cycles += 1;
        snap.cycle = state.cycles;
        snap.timestamp = chrono::Utc::now().timestamp();

        self.reap_tasks();

        if let Some(store) = self.store.upgrade() {
            self.raise_alerts(&store, &snap, &config);

            if config.alerts.retention_days > 0 && state.cycles % RETENTION_SWEEP_EVERY == 0 {
                let cutoff =
                    now_seconds() - chrono::Duration::days(i64::from(config.alerts.retention_days));
                store.purge_dismissed_before(cutoff);
            }

            let open = store.open_counts();
            snap.active_alerts = open.active;
            snap.critical_alerts = open.critical;
        } else {
            debug!("[MONITOR] Alert store gone, skipping alerting");
        }

        state.last = snap.clone();
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = snap.clone();
        debug!(
            "[MONITOR] Cycle {}: cpu {:.1}% mem {:.1}% disk {:.1}%",
            snap.cycle, snap.cpu_usage_percent, snap.memory_usage_percent, snap.disk_usage_percent
        );
        snap
    }

    fn raise_alerts(&self, store: &Arc<AlertStore>, snap: &HealthSnapshot, config: &Config) {
        for finding in thresholds::evaluate(snap, &config.thresholds) {
            if store.has_open(finding.category, finding.severity, MONITOR_SOURCE) {
                continue;
            }

            let alert = match store.create(finding.to_alert()) {
                Ok(alert) => alert,
                Err(e) => {
                    warn!("[MONITOR] Failed to store {} alert: {}", finding.category, e);
                    continue;
                }
            };
            info!("[MONITOR] {} alert: {}", alert.severity, alert.message);

            if let Some(client) = &self.inference {
                self.enrich(alert, &finding.prompt, client.clone(), store, config);
            }
        }
    }

    fn enrich(
        &self,
        alert: cortex_common::alert::Alert,
        prompt: &str,
        client: Arc<dyn InferenceClient>,
        store: &Arc<AlertStore>,
        config: &Config,
    ) {
        let mut tasks = lock(&self.tasks);
        if tasks.len() >= config.monitor.max_enrichment_tasks {
            debug!(
                "[MONITOR] {} enrichment tasks in flight, leaving {} plain",
                tasks.len(),
                alert.id
            );
            return;
        }

        let request = InferenceRequest::new(prompt, &config.llm);
        match enrichment::spawn(
            alert,
            request,
            client,
            Arc::downgrade(store),
            Arc::downgrade(&self.running),
        ) {
            Ok(task) => tasks.push(task),
            Err(e) => warn!("[MONITOR] Cannot spawn enrichment thread: {}", e),
        }
    }

    fn reap_tasks(&self) {
        let mut tasks = lock(&self.tasks);
        let (finished, live): (Vec<_>, Vec<_>) = tasks.drain(..).partition(|t| t.is_done());
        *tasks = live;
        drop(tasks);
        for task in finished {
            task.join();
        }
    }
}

impl Drop for SystemMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Take every measurement, keeping the previous value for any that fails
fn sample(state: &mut CycleState, index: u64, config: &Config) -> HealthSnapshot {
    let mut snap = state.last.clone();
    let sampler = &mut state.sampler;

    match sampler.cpu_counters() {
        Ok(now) => {
            let (earlier, latest) = match state.prev_cpu {
                Some(prev) => (prev, now),
                None => {
                    thread::sleep(CPU_PRIME_INTERVAL);
                    match sampler.cpu_counters() {
                        Ok(second) => (now, second),
                        Err(_) => (now, now),
                    }
                }
            };
            snap.cpu_usage_percent = latest.usage_since(&earlier);
            state.prev_cpu = Some(latest);
        }
        Err(e) => warn!("[MONITOR] CPU sample failed: {}", e),
    }

    snap.cpu_cores = sampler.cpu_cores();

    match sampler.memory() {
        Ok(m) => {
            snap.memory_used_bytes = m.used_bytes;
            snap.memory_total_bytes = m.total_bytes;
            snap.memory_usage_percent = percent(m.used_bytes, m.total_bytes);
        }
        Err(e) => warn!("[MONITOR] Memory sample failed: {}", e),
    }

    match sampler.disk() {
        Ok(d) => {
            snap.disk_usage_percent = percent(d.used_bytes, d.total_bytes);
            snap.disk_used_bytes = d.used_bytes;
            snap.disk_total_bytes = d.total_bytes;
            snap.disk_mount = d.mount;
        }
        Err(e) => warn!("[MONITOR] Disk sample failed: {}", e),
    }

    match sampler.load_average() {
        Ok(load) => snap.load_average = load,
        Err(e) => warn!("[MONITOR] Load average failed: {}", e),
    }

    if index % config.monitor.update_check_every.max(1) == 0 {
        match sampler.updates() {
            Ok(u) => {
                snap.pending_updates = u.pending;
                snap.security_updates = u.security;
            }
            Err(e) => warn!("[MONITOR] Update check failed: {}", e),
        }
    }

    snap
}
