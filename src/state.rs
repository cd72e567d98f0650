//! Sync State Table - in-memory status and lock tracking per repository
//!
//! Each repository id maps to its current [`SyncStatus`] and, while a sync is
//! in flight, a lock carrying a generation number and the cancellation sender
//! of that run. All operations take the table mutex for a short, synchronous
//! critical section; nothing here is ever held across an `.await`.
//!
//! Mutations that finish a run are keyed by generation, so a run that was
//! stopped cannot overwrite the status of a newer run on the same repository.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle state of a repository sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Syncing,
    Error,
}

/// Observable sync status of one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn idle(last_sync_time: Option<DateTime<Utc>>) -> Self {
        Self {
            state: SyncState::Idle,
            progress: None,
            last_error: None,
            last_sync_time,
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self::idle(None)
    }
}

/// Receiving side of a run's cancellation flag
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancellation is requested; pending forever if the run
    /// finishes without being cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Handed out by [`SyncStateTable::try_acquire`] to the run that owns the lock
#[derive(Debug, Clone)]
pub struct SyncTicket {
    pub generation: u64,
    pub cancel: CancelSignal,
}

struct SyncLock {
    generation: u64,
    cancel: watch::Sender<bool>,
}

struct Entry {
    status: SyncStatus,
    lock: Option<SyncLock>,
}

impl Entry {
    fn new(last_sync_time: Option<DateTime<Utc>>) -> Self {
        Self {
            status: SyncStatus::idle(last_sync_time),
            lock: None,
        }
    }

    fn owned_by(&self, generation: u64) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| lock.generation == generation)
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    next_generation: u64,
}

/// Per-repository status map plus the set of in-flight sync locks
#[derive(Default)]
pub struct SyncStateTable {
    inner: Mutex<Inner>,
}

impl SyncStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Critical sections never leave the map half-updated
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically take the lock for `id` and mark it Syncing at 0%.
    ///
    /// Returns `None` if a sync is already in flight. `persisted` seeds the
    /// entry's last sync time when the entry does not exist yet.
    pub fn try_acquire(&self, id: &str, persisted: Option<DateTime<Utc>>) -> Option<SyncTicket> {
        let mut inner = self.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;

        let entry = inner
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(persisted));

        if entry.lock.is_some() {
            return None;
        }

        let (tx, rx) = watch::channel(false);
        entry.lock = Some(SyncLock {
            generation,
            cancel: tx,
        });
        entry.status.state = SyncState::Syncing;
        entry.status.progress = Some(0);
        entry.status.last_error = None;

        debug!("Acquired sync lock for {} (generation {})", id, generation);
        Some(SyncTicket {
            generation,
            cancel: CancelSignal(rx),
        })
    }

    /// Advance progress of the run holding `generation`; progress never moves backwards
    pub fn set_progress(&self, id: &str, generation: u64, progress: u8) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(id) {
            if entry.owned_by(generation) {
                let current = entry.status.progress.unwrap_or(0);
                entry.status.progress = Some(current.max(progress.min(100)));
            }
        }
    }

    /// Complete a successful run: Idle at 100% with a fresh last sync time.
    ///
    /// The recorded time is strictly later than the previous one. Returns
    /// `None` if the run no longer owns the lock.
    pub fn finish_success(&self, id: &str, generation: u64) -> Option<DateTime<Utc>> {
        let mut inner = self.lock();
        let entry = inner.entries.get_mut(id)?;
        if !entry.owned_by(generation) {
            return None;
        }

        let mut now = Utc::now();
        if let Some(previous) = entry.status.last_sync_time {
            if now <= previous {
                now = previous + Duration::milliseconds(1);
            }
        }

        entry.lock = None;
        entry.status = SyncStatus {
            state: SyncState::Idle,
            progress: Some(100),
            last_error: None,
            last_sync_time: Some(now),
        };
        Some(now)
    }

    /// Complete a failed run with an Error status
    pub fn finish_error(&self, id: &str, generation: u64, message: &str) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(id) {
            Some(entry) if entry.owned_by(generation) => {
                entry.lock = None;
                entry.status.state = SyncState::Error;
                entry.status.progress = None;
                entry.status.last_error = Some(message.to_string());
                true
            }
            _ => false,
        }
    }

    /// Release the lock of a run that ended through cancellation, if it still holds it
    pub fn finish_cancelled(&self, id: &str, generation: u64) -> bool {
        let mut inner = self.lock();
        match inner.entries.get_mut(id) {
            Some(entry) if entry.owned_by(generation) => {
                entry.lock = None;
                entry.status.state = SyncState::Idle;
                entry.status.progress = None;
                true
            }
            _ => false,
        }
    }

    /// Signal cancellation to the in-flight run, release its lock and go Idle.
    ///
    /// Returns false if no sync is in flight.
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        let Some(lock) = entry.lock.take() else {
            return false;
        };

        lock.cancel.send_replace(true);
        entry.status.state = SyncState::Idle;
        entry.status.progress = None;
        entry.status.last_error = None;

        debug!("Cancelled sync for {} (generation {})", id, lock.generation);
        true
    }

    /// Current status, if an entry exists
    pub fn status(&self, id: &str) -> Option<SyncStatus> {
        self.lock().entries.get(id).map(|entry| entry.status.clone())
    }

    /// Current status, creating an Idle entry seeded with `persisted` if missing
    pub fn status_or_seed(&self, id: &str, persisted: Option<DateTime<Utc>>) -> SyncStatus {
        self.lock()
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(persisted))
            .status
            .clone()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.lock()
            .entries
            .get(id)
            .is_some_and(|entry| entry.lock.is_some())
    }

    /// Ids with a sync currently in flight
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.lock.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop the entry for `id`, cancelling any in-flight run
    pub fn remove(&self, id: &str) {
        if let Some(entry) = self.lock().entries.remove(id) {
            if let Some(lock) = entry.lock {
                lock.cancel.send_replace(true);
            }
        }
    }
}
