//! Scheduler - periodic sync of every enabled repository
//!
//! Fires every `get_interval()` minutes. Ticks missed while the process was
//! busy are skipped rather than replayed. Each tick starts one batch on its own
//! task, unless the previous batch is still running, in which case the tick is
//! dropped. At most one batch exists at a time, so `max_parallel` bounds the
//! whole scheduler. Repositories already syncing from a manual request are
//! reported as skipped by the engine. Interval changes take effect after the
//! next tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::{SyncEngine, SyncSummary};

/// Length of one interval "minute"
const MINUTE: Duration = Duration::from_secs(60);

/// Counters accumulated across batches
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub batches_started: u64,
    pub batches_failed: u64,
    /// Ticks dropped because the previous batch was still running
    pub ticks_skipped: u64,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub skipped_syncs: u64,
    pub last_batch_at: Option<DateTime<Utc>>,
}

impl SchedulerStats {
    fn record(&mut self, summary: &SyncSummary) {
        self.total_syncs += summary.total_repositories as u64;
        self.successful_syncs += summary.successful_operations as u64;
        self.failed_syncs += summary.failed_operations as u64;
        self.skipped_syncs += summary.skipped_operations as u64;
    }
}

pub struct Scheduler {
    engine: SyncEngine,
    tick_unit: Duration,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl Scheduler {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine,
            tick_unit: MINUTE,
            stats: Arc::new(Mutex::new(SchedulerStats::default())),
        }
    }

    /// Scale interval minutes to `unit` instead of real minutes
    pub fn with_tick_unit(mut self, unit: Duration) -> Self {
        self.tick_unit = unit;
        self
    }

    pub fn stats(&self) -> SchedulerStats {
        lock_stats(&self.stats).clone()
    }

    fn current_interval(&self, fallback: u64) -> u64 {
        match self.engine.get_interval() {
            Ok(minutes) => minutes,
            Err(e) => {
                warn!("Failed to read sync interval, keeping {} minutes: {}", fallback, e);
                fallback
            }
        }
    }

    fn timer(&self, minutes: u64) -> Interval {
        let factor = u32::try_from(minutes.max(1)).unwrap_or(u32::MAX);
        let period = self.tick_unit.saturating_mul(factor);
        let mut timer = interval_at(Instant::now() + period, period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        timer
    }

    /// Run until `shutdown` fires, then cancel in-flight syncs
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let default = self.engine.settings().default_interval_minutes;
        let mut minutes = self.current_interval(default);
        let mut timer = self.timer(minutes);
        let mut batches = JoinSet::new();

        info!("Scheduler started with interval: {} minutes", minutes);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received in scheduler");
                    break;
                }

                _ = timer.tick() => {
                    while let Some(joined) = batches.try_join_next() {
                        log_batch_exit(joined);
                    }
                    if batches.is_empty() {
                        self.spawn_batch(&mut batches);
                    } else {
                        debug!("Previous sync batch still running, skipping tick");
                        lock_stats(&self.stats).ticks_skipped += 1;
                    }

                    let latest = self.current_interval(minutes);
                    if latest != minutes {
                        info!("Sync interval changed from {} to {} minutes", minutes, latest);
                        minutes = latest;
                        timer = self.timer(minutes);
                    }
                }

                Some(joined) = batches.join_next(), if !batches.is_empty() => {
                    log_batch_exit(joined);
                }
            }
        }

        self.shutdown(batches).await;
    }

    fn spawn_batch(&self, batches: &mut JoinSet<()>) {
        let engine = self.engine.clone();
        let stats = self.stats.clone();

        {
            let mut stats = lock_stats(&stats);
            stats.batches_started += 1;
            stats.last_batch_at = Some(Utc::now());
        }
        debug!("Starting scheduled sync batch");

        batches.spawn(async move {
            match engine.sync_enabled_repositories().await {
                Ok(summary) => lock_stats(&stats).record(&summary),
                Err(e) => {
                    error!("Scheduled sync failed: {}", e);
                    lock_stats(&stats).batches_failed += 1;
                }
            }
        });
    }

    async fn shutdown(&self, mut batches: JoinSet<()>) {
        // Queued repositories must not start once shutdown begins
        batches.abort_all();
        while let Some(joined) = batches.join_next().await {
            log_batch_exit(joined);
        }

        let active = self.engine.active_syncs();
        if !active.is_empty() {
            info!("Cancelling {} in-flight syncs", active.len());
            for id in &active {
                self.engine.stop_sync(id);
            }
        }

        info!("Scheduler stopped");
    }
}

fn log_batch_exit(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if !e.is_cancelled() {
            error!("Scheduled batch task failed: {}", e);
        }
    }
}

fn lock_stats(stats: &Mutex<SchedulerStats>) -> MutexGuard<'_, SchedulerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}
