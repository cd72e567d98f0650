//! Common test utilities and helpers for repomirror tests
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use repomirror::crypto::TokenCipher;
use repomirror::{
    CancelSignal, CredentialStore, EngineSettings, MirrorError, MirrorRunner, MirrorStep,
    Platform, PlatformApi, RemoteRepository, Repository, SqliteStore, SyncEngine, SyncStatus,
};

pub const GITHUB_TOKEN: &str = "gh-token";
pub const GITEE_TOKEN: &str = "gt-token";

/// A call recorded by [`StubRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerCall {
    pub step: MirrorStep,
    pub workdir: PathBuf,
    pub target: String,
}

/// Scriptable mirror runner: optional per-step failure and delay, honors cancellation
#[derive(Default)]
pub struct StubRunner {
    calls: Mutex<Vec<RunnerCall>>,
    fail_step: Mutex<Option<MirrorStep>>,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl StubRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_at(&self, step: Option<MirrorStep>) {
        *self.fail_step.lock().unwrap() = step;
    }

    /// Delay applied to every step
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, step: MirrorStep) -> usize {
        self.calls().iter().filter(|c| c.step == step).count()
    }

    pub fn count_for(&self, step: MirrorStep, repo_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.step == step && c.workdir.ends_with(repo_id))
            .count()
    }

    /// Highest number of steps observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn step(
        &self,
        step: MirrorStep,
        workdir: &Path,
        target: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        self.calls.lock().unwrap().push(RunnerCall {
            step,
            workdir: workdir.to_path_buf(),
            target: target.to_string(),
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        let result = tokio::select! {
            _ = tokio::time::sleep(delay) => {
                if *self.fail_step.lock().unwrap() == Some(step) {
                    Err(MirrorError::new(step, Some(1), format!("stub {:?} failure", step)))
                } else {
                    Ok(())
                }
            }
            _ = cancel.cancelled() => Err(MirrorError::cancelled(step)),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[async_trait]
impl MirrorRunner for StubRunner {
    async fn fetch_primary(
        &self,
        workdir: &Path,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        self.step(MirrorStep::FetchPrimary, workdir, url, cancel).await
    }

    async fn configure_secondary(
        &self,
        workdir: &Path,
        remote: &str,
        url: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        let target = format!("{} {}", remote, url);
        self.step(MirrorStep::ConfigureSecondary, workdir, &target, cancel)
            .await
    }

    async fn push_secondary(
        &self,
        workdir: &Path,
        remote: &str,
        cancel: &CancelSignal,
    ) -> Result<(), MirrorError> {
        self.step(MirrorStep::PushSecondary, workdir, remote, cancel)
            .await
    }
}

/// Offline platform client with predictable URLs
pub struct StubPlatform;

#[async_trait]
impl PlatformApi for StubPlatform {
    fn remote_url(&self, platform: Platform, full_name: &str, token: &str) -> anyhow::Result<String> {
        Ok(format!(
            "https://oauth2:{}@{}.example/{}.git",
            token,
            platform.as_str(),
            full_name
        ))
    }

    async fn validate_token(&self, _platform: Platform, _token: &str) -> anyhow::Result<String> {
        Ok("tester".to_string())
    }

    async fn list_repositories(
        &self,
        _platform: Platform,
        _token: &str,
    ) -> anyhow::Result<Vec<RemoteRepository>> {
        Ok(Vec::new())
    }

    async fn fetch_repository(
        &self,
        platform: Platform,
        full_name: &str,
        _token: &str,
    ) -> anyhow::Result<RemoteRepository> {
        Ok(RemoteRepository {
            platform,
            upstream_id: 1,
            full_name: full_name.to_string(),
            description: None,
            private: false,
        })
    }
}

/// Engine wired to an in-memory store, the stub platform and a chosen runner
pub struct TestContext {
    pub engine: SyncEngine,
    pub store: Arc<SqliteStore>,
    pub workspace: TempDir,
}

impl TestContext {
    pub fn new(runner: Arc<dyn MirrorRunner>) -> Self {
        Self::with_max_parallel(runner, 4)
    }

    /// Context without tokens whose batches sync at most `max_parallel` repositories at once
    pub fn with_max_parallel(runner: Arc<dyn MirrorRunner>, max_parallel: usize) -> Self {
        let workspace = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteStore::open_in_memory(TokenCipher::new("test-key").unwrap())
                .expect("Failed to open store"),
        );

        let settings = EngineSettings {
            workspace: workspace.path().to_path_buf(),
            secondary_remote: "secondary".to_string(),
            default_interval_minutes: 30,
            max_parallel,
        };
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(StubPlatform),
            runner,
            settings,
        );

        Self {
            engine,
            store,
            workspace,
        }
    }

    /// Context with both tokens stored
    pub fn with_tokens(runner: Arc<dyn MirrorRunner>) -> Self {
        let ctx = Self::new(runner);
        ctx.store.set_token(Platform::GitHub, GITHUB_TOKEN).unwrap();
        ctx.store.set_token(Platform::Gitee, GITEE_TOKEN).unwrap();
        ctx
    }

    pub fn add_repo(&self, id: &str) -> Repository {
        let repo = Repository::new(id, format!("owner/{}", id), Platform::GitHub, Platform::Gitee);
        self.engine.register_repository(repo).unwrap()
    }

    pub fn stored(&self, id: &str) -> Repository {
        self.store.get_repository(id).unwrap().expect("repository registered")
    }
}

/// Poll `get_status` until `predicate` holds or `timeout` elapses
pub async fn wait_for_status<F>(engine: &SyncEngine, id: &str, timeout: Duration, predicate: F) -> SyncStatus
where
    F: Fn(&SyncStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = engine.get_status(id);
        if predicate(&status) || tokio::time::Instant::now() >= deadline {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Isolated CLI environment: config, store, key and workspace under one temp dir
pub struct CliEnvironment {
    pub temp_dir: TempDir,
    pub config_path: PathBuf,
}

impl CliEnvironment {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path();
        let config_path = root.join("config.yml");

        let config = format!(
            r#"
workspace_directory: "{root}/repos"
store_path: "{root}/data/store.db"
key_file: "{root}/data/master.key"
daemon:
  pid_file: "{root}/repomirror.pid"
  log_file: "{root}/daemon.log"
logging:
  level: "warn"
  color: false
"#,
            root = root.display()
        );
        std::fs::write(&config_path, config).expect("Failed to write test config");

        Self {
            temp_dir,
            config_path,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.temp_dir.path().join(relative)
    }

    pub fn run(&self, args: &[&str]) -> Output {
        self.run_from(self.temp_dir.path(), args)
    }

    /// Run with `cwd` as the working directory
    pub fn run_from(&self, cwd: &Path, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_repomirror"))
            .current_dir(cwd)
            .arg("--config")
            .arg(&self.config_path)
            .args(args)
            .env_remove("REPOMIRROR_ENCRYPTION_KEY")
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to execute repomirror")
    }
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}
