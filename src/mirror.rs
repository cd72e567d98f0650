//! Mirror Operation Runner - the git process boundary of a sync
//!
//! A sync is three independently observable steps run in one working
//! directory: bring the local mirror up to date with the primary remote,
//! point the secondary remote at its credentialed URL, and push every branch
//! and tag to it. [`GitRunner`] performs them with the `git` binary; tests
//! substitute their own [`MirrorRunner`].

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::state::CancelSignal;

/// The three steps of a mirror operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorStep {
    FetchPrimary,
    ConfigureSecondary,
    PushSecondary,
}

impl MirrorStep {
    pub fn code(&self) -> &'static str {
        match self {
            MirrorStep::FetchPrimary => "FETCH_FAILED",
            MirrorStep::ConfigureSecondary => "REMOTE_CONFIG_FAILED",
            MirrorStep::PushSecondary => "PUSH_FAILED",
        }
    }
}

impl fmt::Display for MirrorStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MirrorStep::FetchPrimary => "fetch from primary",
            MirrorStep::ConfigureSecondary => "configure secondary remote",
            MirrorStep::PushSecondary => "push to secondary",
        })
    }
}

/// Why a step did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorFailure {
    /// git ran and exited unsuccessfully, or could not be started
    Failed,
    TimedOut,
    Cancelled,
}

/// A failed mirror step; `stderr` never contains inline credentials
#[derive(Debug, Clone, Error)]
#[error("{step} failed{}: {stderr}", .exit_code.map(|c| format!(" (exit code {})", c)).unwrap_or_default())]
pub struct MirrorError {
    pub step: MirrorStep,
    pub kind: MirrorFailure,
    pub exit_code: Option<i32>,
    pub stderr: String,
}

impl MirrorError {
    pub fn new(step: MirrorStep, exit_code: Option<i32>, stderr: impl AsRef<str>) -> Self {
        Self {
            step,
            kind: MirrorFailure::Failed,
            exit_code,
            stderr: redact_credentials(stderr.as_ref().trim()),
        }
    }

    pub fn timed_out(step: MirrorStep, after: Duration) -> Self {
        Self {
            step,
            kind: MirrorFailure::TimedOut,
            exit_code: None,
            stderr: format!("timed out after {}s", after.as_secs()),
        }
    }

    pub fn cancelled(step: MirrorStep) -> Self {
        Self {
            step,
            kind: MirrorFailure::Cancelled,
            exit_code: None,
            stderr: "cancelled".to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == MirrorFailure::Cancelled
    }
}

/// Replace the userinfo part of any URL in `text` with `***`
pub fn redact_credentials(text: &str) -> String {
    static USERINFO: OnceLock<Option<Regex>> = OnceLock::new();
    match USERINFO.get_or_init(|| Regex::new(r"(?P<scheme>[A-Za-z][A-Za-z0-9+.\-]*://)[^/\s@]+@").ok()) {
        Some(re) => re.replace_all(text, "${scheme}***@").into_owned(),
        None => text.to_string(),
    }
}

/// Process executor for the mirror steps
#[async_trait]
pub trait MirrorRunner: Send + Sync {
    /// Mirror-clone `url` into `workdir`, or refresh an existing mirror there
    async fn fetch_primary(
        &self,
        workdir: &Path,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError>;

    /// Add `remote` pointing at `url`, or repoint it if it already exists
    async fn configure_secondary(
        &self,
        workdir: &Path,
        remote: &str,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError>;

    /// Push all branches and tags to `remote`
    async fn push_secondary(
        &self,
        workdir: &Path,
        remote: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError>;
}

/// [`MirrorRunner`] backed by the git command line
#[derive(Debug, Clone)]
pub struct GitRunner {
    step_timeout: Duration,
}

impl GitRunner {
    pub fn new(step_timeout: Duration) -> Self {
        Self { step_timeout }
    }

    /// Whether `workdir` already holds a mirror clone
    pub fn is_mirror(workdir: &Path) -> bool {
        workdir.join("HEAD").is_file() && workdir.join("refs").is_dir()
    }

    /// Run one git command, bounded by the step timeout and the cancel signal
    async fn git(
        &self,
        step: MirrorStep,
        cwd: &Path,
        args: &[&str],
        cancel: &CancelSignal,
    ) -> Result<String, MirrorError> {
        if cancel.is_cancelled() {
            return Err(MirrorError::cancelled(step));
        }

        debug!("git {} (in {})", redact_credentials(&args.join(" ")), cwd.display());

        let mut command = AsyncCommand::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so helpers spawned by git die with it
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|e| MirrorError::new(step, None, format!("failed to run git: {}", e)))?;
        let pid = child.id();

        tokio::select! {
            result = timeout(self.step_timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) if output.status.success() => {
                    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
                }
                Ok(Ok(output)) => Err(MirrorError::new(
                    step,
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr),
                )),
                Ok(Err(e)) => Err(MirrorError::new(step, None, format!("failed to wait for git: {}", e))),
                Err(_) => {
                    warn!("git {} timed out after {:?}", step, self.step_timeout);
                    kill_process_group(pid);
                    Err(MirrorError::timed_out(step, self.step_timeout))
                }
            },
            _ = cancel.cancelled() => {
                info!("Cancelling git {}", step);
                kill_process_group(pid);
                Err(MirrorError::cancelled(step))
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("Failed to kill git process group {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[async_trait]
impl MirrorRunner for GitRunner {
    async fn fetch_primary(
        &self,
        workdir: &Path,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        let step = MirrorStep::FetchPrimary;

        if Self::is_mirror(workdir) {
            debug!("Refreshing existing mirror at {}", workdir.display());
            self.git(step, workdir, &["remote", "set-url", "origin", url], cancel)
                .await?;
            self.git(step, workdir, &["fetch", "--prune", "origin"], cancel)
                .await?;
            return Ok(());
        }

        // Leftovers of an interrupted clone
        if workdir.exists() {
            warn!("Removing incomplete mirror at {}", workdir.display());
            tokio::fs::remove_dir_all(workdir).await.map_err(|e| {
                MirrorError::new(step, None, format!("failed to clear {}: {}", workdir.display(), e))
            })?;
        }

        let parent = match workdir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let Some(name) = workdir.file_name() else {
            return Err(MirrorError::new(
                step,
                None,
                format!("invalid working directory {}", workdir.display()),
            ));
        };
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            MirrorError::new(step, None, format!("failed to create {}: {}", parent.display(), e))
        })?;

        // git runs inside `parent`, so the target is relative to it
        let target = name.to_string_lossy();
        info!("Cloning mirror into {}", workdir.display());
        self.git(step, parent, &["clone", "--mirror", url, target.as_ref()], cancel)
            .await?;
        Ok(())
    }

    async fn configure_secondary(
        &self,
        workdir: &Path,
        remote: &str,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        let step = MirrorStep::ConfigureSecondary;

        let remotes = self.git(step, workdir, &["remote"], cancel).await?;
        if remotes.lines().any(|line| line.trim() == remote) {
            self.git(step, workdir, &["remote", "set-url", remote, url], cancel)
                .await?;
        } else {
            self.git(step, workdir, &["remote", "add", remote, url], cancel)
                .await?;
        }
        Ok(())
    }

    async fn push_secondary(
        &self,
        workdir: &Path,
        remote: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        let step = MirrorStep::PushSecondary;

        self.git(step, workdir, &["push", remote, "--all"], cancel)
            .await?;
        self.git(step, workdir, &["push", remote, "--tags"], cancel)
            .await?;
        Ok(())
    }
}
