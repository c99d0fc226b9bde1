//! cortexd - host health daemon entry point

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use cortex_common::paths::{CONFIG_ENV, DEFAULT_CONFIG_PATH};
use cortexd::{Daemon, DaemonOptions};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cortexd", version, about = "Cortex host health daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Startup builds blocking HTTP clients, which must not run on a runtime thread
    let options = DaemonOptions::from_path(&args.config);
    let daemon = tokio::task::spawn_blocking(move || Daemon::start(options))
        .await
        .context("startup task failed")?
        .with_context(|| format!("failed to start with {}", args.config.display()))?;
    let daemon = Arc::new(daemon);
    let shutdown = daemon.shutdown_signal();

    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("SIGHUP handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("[DAEMON] SIGINT received");
                break;
            }
            _ = sigterm.recv() => {
                info!("[DAEMON] SIGTERM received");
                break;
            }
            _ = sighup.recv() => {
                info!("[DAEMON] SIGHUP received, reloading config");
                let d = daemon.clone();
                match tokio::task::spawn_blocking(move || d.reload_config()).await {
                    Ok(Ok(_)) => info!("[DAEMON] Config reloaded"),
                    Ok(Err(e)) => error!("[DAEMON] Reload failed, keeping old config: {}", e),
                    Err(e) => error!("[DAEMON] Reload task failed: {}", e),
                }
            }
            _ = shutdown.wait() => {
                info!("[DAEMON] Shutdown requested over IPC");
                break;
            }
        }
    }

    tokio::task::spawn_blocking(move || {
        daemon.shutdown();
        drop(daemon);
    })
    .await
    .context("shutdown task failed")?;

    Ok(())
}
