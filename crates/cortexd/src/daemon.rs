//! Daemon core - wires config, logging, alert store, monitor and IPC server
//!
//! Startup order:
//!   config -> logging -> alert store -> inference backend -> monitor
//!   -> handler table -> socket bind -> monitor thread -> accept thread
//!
//! Shutdown runs in reverse and is idempotent.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::alert_store::{AlertStore, StoreError};
use crate::config::{Config, ConfigError, ConfigStore};
use crate::handlers;
use crate::inference::{self, InferenceClient};
use crate::logging::{self, LogHandle};
use crate::monitor::sampler::{Sampler, SystemSampler};
use crate::monitor::SystemMonitor;
use crate::rate_limiter::RateLimiter;
use crate::server::{IpcServer, ServerError, ServerOptions};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("alert store: {0}")]
    Store(#[from] StoreError),
    #[error("IPC server: {0}")]
    Server(#[from] ServerError),
    #[error("thread spawn failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Set once by any shutdown source, awaited by the main task
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    requested: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once `request` has been called, before or after this call
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// How to build a daemon. Tests swap the sampler and backend.
pub struct DaemonOptions {
    pub config_path: Option<PathBuf>,
    /// Used when `config_path` is None
    pub config: Config,
    pub init_logging: bool,
    pub sampler: Option<Box<dyn Sampler>>,
    /// Overrides the backend built from `[llm]`
    pub inference: Option<Arc<dyn InferenceClient>>,
}

impl DaemonOptions {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: Some(path.into()),
            config: Config::default(),
            init_logging: true,
            sampler: None,
            inference: None,
        }
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config_path: None,
            config,
            init_logging: false,
            sampler: None,
            inference: None,
        }
    }

    pub fn with_sampler(mut self, sampler: Box<dyn Sampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_inference(mut self, client: Arc<dyn InferenceClient>) -> Self {
        self.inference = Some(client);
        self
    }
}

/// State shared with every RPC handler
pub struct DaemonContext {
    pub config: Arc<ConfigStore>,
    pub alerts: Arc<AlertStore>,
    pub monitor: Arc<SystemMonitor>,
    pub limiter: Arc<RateLimiter>,
    pub log: LogHandle,
    pub shutdown: ShutdownSignal,
    started_at: Instant,
}

impl DaemonContext {
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Re-read the config file and apply what can change at runtime:
    /// rate limit, log level, thresholds and monitor cadence. Socket and
    /// database paths need a restart.
    pub fn reload_config(&self) -> Result<Arc<Config>, ConfigError> {
        let old = self.config.get();
        let new = self.config.reload()?;

        self.limiter.set_limit(new.server.max_requests_per_sec);
        if new.log.level != old.log.level {
            self.log.set_level(new.log_level());
            info!("[CONFIG] Log level now {}", new.log_level().as_str());
        }
        if new.server.socket_path != old.server.socket_path {
            warn!("[CONFIG] server.socket_path changed; restart to apply");
        }
        if new.alerts.db_path != old.alerts.db_path {
            warn!("[CONFIG] alerts.db_path changed; restart to apply");
        }
        if new.llm != old.llm {
            warn!("[CONFIG] [llm] changed; restart to switch backend");
        }
        Ok(new)
    }
}

pub struct Daemon {
    ctx: Arc<DaemonContext>,
    server: IpcServer,
    stopped: AtomicBool,
}

impl Daemon {
    pub fn start(options: DaemonOptions) -> Result<Self, DaemonError> {
        let DaemonOptions {
            config_path,
            config,
            init_logging,
            sampler,
            inference,
        } = options;

        let config_store = Arc::new(match config_path {
            Some(path) => ConfigStore::load(path)?,
            None => {
                config.validate()?;
                ConfigStore::from_config(config)
            }
        });
        let config = config_store.get();

        let log = if init_logging {
            logging::init(config.log_level())
        } else {
            LogHandle::disabled()
        };
        info!("[DAEMON] {} v{} starting", cortex_common::NAME, cortex_common::VERSION);

        let alerts = Arc::new(AlertStore::open_or_in_memory(&config.alerts.db_path)?);
        info!("[DAEMON] Alert store at {}", alerts.location());

        let inference = inference.or_else(|| inference::build_client(&config.llm));
        match &inference {
            Some(client) => info!("[DAEMON] Alert enrichment via {} backend", client.backend().as_str()),
            None => info!("[DAEMON] Alert enrichment disabled"),
        }

        let sampler = sampler.unwrap_or_else(|| Box::new(SystemSampler::new()));
        let monitor = Arc::new(SystemMonitor::with_sampler(
            config_store.clone(),
            Arc::downgrade(&alerts),
            inference,
            sampler,
        ));

        let limiter = Arc::new(RateLimiter::new(config.server.max_requests_per_sec));

        let ctx = Arc::new(DaemonContext {
            config: config_store,
            alerts,
            monitor,
            limiter: limiter.clone(),
            log,
            shutdown: ShutdownSignal::new(),
            started_at: Instant::now(),
        });

        let table = handlers::build_table(ctx.clone());
        let server = IpcServer::bind(&ServerOptions::from(&config.server), table, limiter)?;

        ctx.monitor.start()?;
        if let Err(e) = server.spawn() {
            ctx.monitor.stop();
            return Err(e.into());
        }

        info!("[DAEMON] Ready on {}", server.socket_path().display());
        Ok(Self {
            ctx,
            server,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &Arc<DaemonContext> {
        &self.ctx
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.ctx.shutdown.clone()
    }

    pub fn socket_path(&self) -> &std::path::Path {
        self.server.socket_path()
    }

    pub fn reload_config(&self) -> Result<Arc<Config>, ConfigError> {
        self.ctx.reload_config()
    }

    /// Stop accepting, stop the monitor, wait for enrichment, remove the socket
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[DAEMON] Shutting down after {}s", self.ctx.uptime().as_secs());

        self.server.stop();
        self.ctx.monitor.stop();
        self.server.cleanup();

        if self.ctx.monitor.pending_enrichments() > 0 {
            error!("[DAEMON] Enrichment tasks still running after stop");
        }
        info!("[DAEMON] Stopped");
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
