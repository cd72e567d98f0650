//! repomirror - Git repository mirroring between hosting platforms
//!
//! repomirror keeps a secondary copy of selected repositories in sync with
//! their primary platform (GitHub by default, mirrored to Gitee), on demand or
//! on a configurable interval.
//!
//! ## Core Features
//!
//! - **Guarded syncs**: at most one sync per repository, rejected rather than queued
//! - **Mirror steps**: clone or refresh, configure the secondary remote, push branches and tags
//! - **Encrypted credentials**: per-platform tokens stored with AES-256-GCM
//! - **Scheduling**: periodic sync of every enabled repository from a daemon
//!
//! ## Modules
//!
//! - [`engine`]: sync orchestration and status queries
//! - [`mirror`]: git process boundary
//! - [`state`]: in-memory status and lock table
//! - [`store`]: SQLite persistence for tokens, repositories and settings
//! - [`platform`]: GitHub and Gitee API clients
//! - [`scheduler`] / [`daemon`]: periodic background syncing

pub mod config;
pub mod crypto;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod health;
pub mod mirror;
pub mod platform;
pub mod repository;
pub mod scheduler;
pub mod state;
pub mod store;

pub use config::Config;
pub use daemon::Daemon;
pub use engine::{EngineSettings, SyncEngine, SyncSummary};
pub use error::{SyncError, SyncResult};
pub use health::HealthCheck;
pub use mirror::{GitRunner, MirrorError, MirrorRunner, MirrorStep};
pub use platform::{Platform, PlatformApi, PlatformClient};
pub use repository::{RemoteRepository, Repository, RepositoryUpdate};
pub use scheduler::Scheduler;
pub use state::{CancelSignal, SyncState, SyncStatus};
pub use store::{CredentialStore, SqliteStore};
