//! Daemon Infrastructure - Background service for scheduled repository mirroring
//!
//! This module runs the [`Scheduler`] as a long-lived process with PID file
//! management and graceful shutdown on Ctrl+C or SIGTERM.

use crate::engine::SyncEngine;
use crate::scheduler::Scheduler;
use crate::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    engine: SyncEngine,
    shutdown_sender: broadcast::Sender<()>,
    pid_file_path: Option<PathBuf>,
}

impl Daemon {
    /// Create a new daemon instance around an engine
    pub fn new(config: Config, engine: SyncEngine) -> Self {
        let (shutdown_sender, _) = broadcast::channel(1);
        let pid_file_path = pid_file_path(&config);

        Self {
            config: Arc::new(config),
            engine,
            shutdown_sender,
            pid_file_path,
        }
    }

    /// Run the scheduler in the current process until shut down
    pub async fn run(&self) -> Result<()> {
        info!("Starting repomirror daemon");

        self.write_pid_file().context("Failed to write PID file")?;

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let shutdown_sender = self.shutdown_sender.clone();
        let signal_task = tokio::spawn(async move {
            match wait_for_shutdown_signal().await {
                Ok(()) => info!("Shutdown signal received, stopping daemon..."),
                Err(e) => warn!("Failed to listen for shutdown signals: {}", e),
            }
            let _ = shutdown_sender.send(());
        });

        Scheduler::new(self.engine.clone())
            .run(shutdown_receiver)
            .await;

        signal_task.abort();
        self.cleanup().context("Failed to cleanup daemon")
    }

    /// Detach into the background (Unix platforms).
    ///
    /// Must be called before any async runtime is started.
    #[cfg(unix)]
    pub fn daemonize(&self) -> Result<()> {
        use daemonize::Daemonize;

        let log_file = if !self.config.daemon.log_file.is_empty() {
            let path = PathBuf::from(&self.config.daemon.log_file);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("Failed to create log directory")?;
            }
            let log_file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context("Failed to open log file")?;
            Some(log_file)
        } else {
            None
        };

        let mut daemonize = Daemonize::new().working_directory(".");

        if let Some(log_file) = log_file {
            daemonize = daemonize.stdout(log_file.try_clone()?).stderr(log_file);
        }

        daemonize.start().context("Failed to daemonize process")?;

        info!("repomirror daemon started as background service");
        Ok(())
    }

    /// Write PID file for daemon process management
    fn write_pid_file(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            let pid = std::process::id();

            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent).context("Failed to create PID file directory")?;
            }

            fs::write(pid_file, pid.to_string()).context("Failed to write PID file")?;

            info!("PID file written: {} (PID: {})", pid_file.display(), pid);
        }

        Ok(())
    }

    /// Remove PID file and perform cleanup
    fn cleanup(&self) -> Result<()> {
        if let Some(pid_file) = &self.pid_file_path {
            if pid_file.exists() {
                fs::remove_file(pid_file).context("Failed to remove PID file")?;
                info!("PID file removed: {}", pid_file.display());
            }
        }

        info!("Daemon cleanup completed");
        Ok(())
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                debug!("Ctrl+C received");
            }
            _ = sigterm.recv() => debug!("SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        debug!("Ctrl+C received");
    }

    Ok(())
}

fn pid_file_path(config: &Config) -> Option<PathBuf> {
    if config.daemon.pid_file.is_empty() {
        None
    } else {
        Some(PathBuf::from(&config.daemon.pid_file))
    }
}

/// PID of the running daemon, removing a stale PID file
pub fn running_daemon_pid(config: &Config) -> Result<Option<u32>> {
    let Some(pid_file) = pid_file_path(config) else {
        return Ok(None);
    };
    if !pid_file.exists() {
        return Ok(None);
    }

    let pid_str = fs::read_to_string(&pid_file).context("Failed to read PID file")?;
    let pid: u32 = pid_str.trim().parse().context("Invalid PID in PID file")?;

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal;
        use nix::unistd::Pid;

        match signal::kill(Pid::from_raw(pid as i32), None) {
            Ok(()) => Ok(Some(pid)),
            Err(Errno::ESRCH) => {
                debug!("Removing stale PID file {}", pid_file.display());
                let _ = fs::remove_file(&pid_file);
                Ok(None)
            }
            // Exists but belongs to someone else
            Err(_) => Ok(Some(pid)),
        }
    }

    #[cfg(not(unix))]
    {
        Ok(Some(pid))
    }
}

/// Check if daemon is currently running by checking PID file
pub fn is_daemon_running(config: &Config) -> Result<bool> {
    Ok(running_daemon_pid(config)?.is_some())
}

/// Ask a running daemon to shut down; returns false if none was running
pub fn stop_daemon(config: &Config) -> Result<bool> {
    let Some(pid) = running_daemon_pid(config)? else {
        warn!("PID file not found, daemon may not be running");
        return Ok(false);
    };

    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .context("Failed to send SIGTERM to daemon process")?;
    }

    #[cfg(not(unix))]
    {
        warn!("Daemon stop not implemented for this platform");
    }

    info!("Shutdown signal sent to daemon process {}", pid);
    Ok(true)
}
