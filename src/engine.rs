//! Sync Engine - guards and drives repository mirror operations
//!
//! The engine validates preconditions, takes the per-repository lock in the
//! state table, runs the three mirror steps on a dedicated task, records the
//! outcome and persists `last_sync_time`. At most one sync per repository is
//! in flight; a second request is rejected immediately, never queued.

use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::error::{SyncError, SyncResult};
use crate::mirror::{GitRunner, MirrorError, MirrorRunner, MirrorStep};
use crate::platform::{PlatformApi, PlatformClient};
use crate::repository::{Repository, RepositoryUpdate};
use crate::state::{SyncStateTable, SyncStatus, SyncTicket};
use crate::store::{CredentialStore, SqliteStore, SYNC_INTERVAL_KEY};

/// Progress checkpoints reported after each committed step
const PROGRESS_FETCHED: u8 = 30;
const PROGRESS_CONFIGURED: u8 = 60;

/// Engine settings taken from the configuration file
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Parent of the per-repository working directories
    pub workspace: PathBuf,
    pub secondary_remote: String,
    pub default_interval_minutes: u64,
    pub max_parallel: usize,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace: config.workspace_path(),
            secondary_remote: config.sync.secondary_remote.clone(),
            default_interval_minutes: u64::from(config.sync.default_interval_minutes),
            max_parallel: config.sync.max_parallel,
        }
    }
}

/// Results of syncing every enabled repository
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub total_repositories: usize,
    pub successful_operations: usize,
    pub failed_operations: usize,
    /// Repositories that already had a sync in flight
    pub skipped_operations: usize,
    #[serde(skip)]
    pub duration: Duration,
    pub results: Vec<RepositorySyncResult>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySyncResult {
    pub repository_id: String,
    #[serde(flatten)]
    pub result: SyncResult,
}

struct Tokens {
    primary: String,
    secondary: String,
}

struct EngineInner {
    store: Arc<dyn CredentialStore>,
    platforms: Arc<dyn PlatformApi>,
    runner: Arc<dyn MirrorRunner>,
    table: SyncStateTable,
    settings: EngineSettings,
}

/// Repository synchronization engine; cheap to clone
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        platforms: Arc<dyn PlatformApi>,
        runner: Arc<dyn MirrorRunner>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                platforms,
                runner,
                table: SyncStateTable::new(),
                settings,
            }),
        }
    }

    /// Build the production engine: SQLite store, platform clients and git
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let cipher = TokenCipher::from_env_or_file(Path::new(&config.key_file))
            .context("Failed to load encryption key")?;
        let store = SqliteStore::open_at(Path::new(&config.store_path), cipher)
            .context("Failed to open credential store")?;
        let platforms = PlatformClient::new(config.platforms.clone());
        let runner = GitRunner::new(config.sync.step_timeout());

        Ok(Self::new(
            Arc::new(store),
            Arc::new(platforms),
            Arc::new(runner),
            EngineSettings::from_config(config),
        ))
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.store
    }

    pub fn platforms(&self) -> &Arc<dyn PlatformApi> {
        &self.inner.platforms
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Working directory holding the mirror of `repo_id`
    pub fn workdir(&self, repo_id: &str) -> PathBuf {
        self.inner.settings.workspace.join(repo_id)
    }

    /// Sync one repository from its primary to its secondary platform.
    ///
    /// Returns immediately with `SYNC_ALREADY_RUNNING` if a sync of the same
    /// repository is in flight. Otherwise the mirror steps run on their own
    /// task and this resolves with their outcome.
    pub async fn start_sync(&self, repo_id: &str) -> SyncResult {
        let (repo, tokens) = match self.preconditions(repo_id) {
            Ok(ready) => ready,
            Err(e) => {
                debug!("Sync of {} rejected: {}", repo_id, e);
                return SyncResult::failed(&e);
            }
        };

        let Some(ticket) = self.inner.table.try_acquire(repo_id, repo.last_sync_time) else {
            debug!("Sync of {} already running", repo_id);
            return SyncResult::failed(&SyncError::AlreadyRunning);
        };
        let generation = ticket.generation;

        info!("Starting sync of {} ({})", repo.full_name, repo_id);

        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run(repo, tokens, ticket).await });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                let message = format!("Sync task failed: {}", e);
                error!("Sync of {} aborted: {}", repo_id, message);
                self.inner.table.finish_error(repo_id, generation, &message);
                SyncResult {
                    success: false,
                    message: None,
                    error: Some(message),
                }
            }
        }
    }

    /// Cancel the in-flight sync of `repo_id` and return it to Idle
    pub fn stop_sync(&self, repo_id: &str) -> SyncResult {
        if self.inner.table.cancel(repo_id) {
            info!("Stopped sync of {}", repo_id);
            SyncResult::ok("Sync stopped")
        } else {
            SyncResult::failed(&SyncError::NoSyncTask)
        }
    }

    /// Current status; Idle for repositories never synced
    pub fn get_status(&self, repo_id: &str) -> SyncStatus {
        if let Some(status) = self.inner.table.status(repo_id) {
            return status;
        }

        match self.inner.store.get_repository(repo_id) {
            Ok(Some(repo)) => self.inner.table.status_or_seed(repo_id, repo.last_sync_time),
            Ok(None) => SyncStatus::default(),
            Err(e) => {
                warn!("Failed to read repository {}: {:#}", repo_id, e);
                SyncStatus::default()
            }
        }
    }

    /// Ids of repositories with a sync in flight
    pub fn active_syncs(&self) -> Vec<String> {
        self.inner.table.active()
    }

    /// Persist the scheduler interval; zero and negative values are rejected
    pub fn set_interval(&self, minutes: i64) -> Result<(), SyncError> {
        if minutes <= 0 {
            return Err(SyncError::InvalidInterval(minutes));
        }
        self.inner
            .store
            .set_setting(SYNC_INTERVAL_KEY, &minutes.to_string())?;
        info!("Sync interval set to {} minutes", minutes);
        Ok(())
    }

    /// Scheduler interval in minutes, falling back to the configured default
    pub fn get_interval(&self) -> Result<u64, SyncError> {
        let default = self.inner.settings.default_interval_minutes;
        let Some(value) = self.inner.store.get_setting(SYNC_INTERVAL_KEY)? else {
            return Ok(default);
        };

        match value.trim().parse::<u64>() {
            Ok(minutes) if minutes > 0 => Ok(minutes),
            _ => {
                warn!("Ignoring invalid stored sync interval {:?}", value);
                Ok(default)
            }
        }
    }

    /// Register (or replace) a repository with sync enabled
    pub fn register_repository(&self, mut repo: Repository) -> Result<Repository, SyncError> {
        repo.sync_enabled = true;
        self.inner.store.add_repository(&repo)?;
        info!("Registered {} as {}", repo.full_name, repo.id);
        Ok(repo)
    }

    /// Stop any in-flight sync and forget the repository; its working directory is kept
    pub fn unregister_repository(&self, repo_id: &str) -> Result<(), SyncError> {
        self.inner.table.remove(repo_id);
        if !self.inner.store.remove_repository(repo_id)? {
            return Err(SyncError::RepositoryNotFound(repo_id.to_string()));
        }
        info!("Unregistered {}", repo_id);
        Ok(())
    }

    pub fn set_sync_enabled(&self, repo_id: &str, enabled: bool) -> Result<Repository, SyncError> {
        self.inner
            .store
            .update_repository(repo_id, RepositoryUpdate::sync_enabled(enabled))?
            .ok_or_else(|| SyncError::RepositoryNotFound(repo_id.to_string()))
    }

    pub fn list_repositories(&self) -> Result<Vec<Repository>, SyncError> {
        Ok(self.inner.store.list_repositories()?)
    }

    /// Sync every enabled repository, at most `max_parallel` at a time
    pub async fn sync_enabled_repositories(&self) -> Result<SyncSummary, SyncError> {
        let start_time = Instant::now();
        let repositories: Vec<Repository> = self
            .list_repositories()?
            .into_iter()
            .filter(|repo| repo.sync_enabled)
            .collect();

        let max_parallel = self.inner.settings.max_parallel.max(1);
        info!(
            "Syncing {} enabled repositories (max {} in parallel)",
            repositories.len(),
            max_parallel
        );

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut futures = FuturesUnordered::new();

        for repo in repositories {
            let semaphore = semaphore.clone();
            let engine = self.clone();

            futures.push(async move {
                let _permit = semaphore.acquire().await.ok();
                let result = engine.start_sync(&repo.id).await;
                RepositorySyncResult {
                    repository_id: repo.id,
                    result,
                }
            });
        }

        let mut results = Vec::new();
        while let Some(result) = futures.next().await {
            results.push(result);
        }

        let summary = Self::compile_summary(results, start_time.elapsed());
        info!(
            "Sync completed in {:.2}s: {} successful, {} failed, {} skipped",
            summary.duration.as_secs_f64(),
            summary.successful_operations,
            summary.failed_operations,
            summary.skipped_operations
        );
        Ok(summary)
    }

    fn compile_summary(results: Vec<RepositorySyncResult>, duration: Duration) -> SyncSummary {
        let skipped_operations = results
            .iter()
            .filter(|r| r.result.is_error(SyncError::AlreadyRunning.code()))
            .count();
        let successful_operations = results.iter().filter(|r| r.result.success).count();

        SyncSummary {
            total_repositories: results.len(),
            successful_operations,
            failed_operations: results.len() - successful_operations - skipped_operations,
            skipped_operations,
            duration,
            results,
        }
    }

    /// Registered repository plus both tokens, checked before any lock is taken
    fn preconditions(&self, repo_id: &str) -> Result<(Repository, Tokens), SyncError> {
        let repo = self
            .inner
            .store
            .get_repository(repo_id)?
            .ok_or_else(|| SyncError::RepositoryNotFound(repo_id.to_string()))?;

        let store = &self.inner.store;
        let primary = store.get_token(repo.primary_platform)?;
        let secondary = store.get_token(repo.secondary_platform)?;

        match (primary, secondary) {
            (Some(primary), Some(secondary)) if !primary.is_empty() && !secondary.is_empty() => {
                Ok((repo, Tokens { primary, secondary }))
            }
            _ => Err(SyncError::TokensNotSet),
        }
    }

    /// Body of the sync task; owns the lock identified by `ticket`
    async fn run(&self, repo: Repository, tokens: Tokens, ticket: SyncTicket) -> SyncResult {
        let table = &self.inner.table;
        let started = Instant::now();

        match self.mirror(&repo, &tokens, &ticket).await {
            Ok(()) => {
                let Some(completed_at) = table.finish_success(&repo.id, ticket.generation) else {
                    info!("Sync of {} was stopped before it could complete", repo.id);
                    return SyncResult::failed(&SyncError::Cancelled);
                };

                if let Err(e) = self
                    .inner
                    .store
                    .update_repository(&repo.id, RepositoryUpdate::last_sync_time(completed_at))
                {
                    warn!("Failed to persist last sync time of {}: {:#}", repo.id, e);
                }

                info!(
                    "Synced {} in {:.2}s",
                    repo.full_name,
                    started.elapsed().as_secs_f64()
                );
                SyncResult::ok(format!("Synced {}", repo.full_name))
            }
            Err(SyncError::Cancelled) => {
                table.finish_cancelled(&repo.id, ticket.generation);
                info!("Sync of {} cancelled", repo.id);
                SyncResult::failed(&SyncError::Cancelled)
            }
            Err(e) => {
                let message = e.result_error();
                if table.finish_error(&repo.id, ticket.generation, &message) {
                    warn!("Sync of {} failed: {}", repo.full_name, message);
                }
                SyncResult::failed(&e)
            }
        }
    }

    async fn mirror(
        &self,
        repo: &Repository,
        tokens: &Tokens,
        ticket: &SyncTicket,
    ) -> Result<(), SyncError> {
        let inner = &self.inner;
        let workdir = self.workdir(&repo.id);
        let remote = inner.settings.secondary_remote.as_str();

        let primary_url = inner
            .platforms
            .remote_url(repo.primary_platform, &repo.full_name, &tokens.primary)
            .map_err(|e| MirrorError::new(MirrorStep::FetchPrimary, None, format!("{:#}", e)))?;

        checkpoint(ticket)?;
        inner
            .runner
            .fetch_primary(&workdir, &primary_url, &ticket.cancel)
            .await
            .map_err(step_error)?;
        inner
            .table
            .set_progress(&repo.id, ticket.generation, PROGRESS_FETCHED);

        let secondary_url = inner
            .platforms
            .remote_url(repo.secondary_platform, &repo.full_name, &tokens.secondary)
            .map_err(|e| {
                MirrorError::new(MirrorStep::ConfigureSecondary, None, format!("{:#}", e))
            })?;

        checkpoint(ticket)?;
        inner
            .runner
            .configure_secondary(&workdir, remote, &secondary_url, &ticket.cancel)
            .await
            .map_err(step_error)?;
        inner
            .table
            .set_progress(&repo.id, ticket.generation, PROGRESS_CONFIGURED);

        checkpoint(ticket)?;
        inner
            .runner
            .push_secondary(&workdir, remote, &ticket.cancel)
            .await
            .map_err(step_error)?;

        checkpoint(ticket)
    }
}

fn checkpoint(ticket: &SyncTicket) -> Result<(), SyncError> {
    if ticket.cancel.is_cancelled() {
        Err(SyncError::Cancelled)
    } else {
        Ok(())
    }
}

fn step_error(e: MirrorError) -> SyncError {
    if e.is_cancelled() {
        SyncError::Cancelled
    } else {
        SyncError::Mirror(e)
    }
}
