use serde::Serialize;
use thiserror::Error;

use crate::mirror::MirrorError;

/// Failure modes of the sync engine, each with a stable code
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("A sync is already running for this repository")]
    AlreadyRunning,

    #[error("Tokens for both platforms must be set before syncing")]
    TokensNotSet,

    #[error("No sync is running for this repository")]
    NoSyncTask,

    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Sync interval must be a positive number of minutes, got {0}")]
    InvalidInterval(i64),

    #[error("Sync was cancelled")]
    Cancelled,

    #[error("Store error: {0:#}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::Store(e)
    }
}

impl SyncError {
    /// Stable identifier reported in `SyncResult::error`
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::AlreadyRunning => "SYNC_ALREADY_RUNNING",
            SyncError::TokensNotSet => "TOKENS_NOT_SET",
            SyncError::NoSyncTask => "NO_SYNC_TASK",
            SyncError::RepositoryNotFound(_) => "REPOSITORY_NOT_FOUND",
            SyncError::InvalidInterval(_) => "INVALID_INTERVAL",
            SyncError::Cancelled => "SYNC_CANCELLED",
            SyncError::Store(_) => "STORE_ERROR",
            SyncError::Mirror(e) => e.step.code(),
        }
    }

    /// Text carried in `SyncResult::error`: the code for engine conditions,
    /// the redacted git message for step failures
    pub fn result_error(&self) -> String {
        match self {
            SyncError::Mirror(e) => e.to_string(),
            other => other.code().to_string(),
        }
    }
}

/// Outcome returned to callers of the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn failed(error: &SyncError) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(error.result_error()),
        }
    }

    /// True if this result reports `code`
    pub fn is_error(&self, code: &str) -> bool {
        self.error.as_deref() == Some(code)
    }
}

impl From<Result<String, SyncError>> for SyncResult {
    fn from(result: Result<String, SyncError>) -> Self {
        match result {
            Ok(message) => SyncResult::ok(message),
            Err(e) => SyncResult::failed(&e),
        }
    }
}
