//! Credential Store - SQLite-backed persistence for tokens, repositories and settings
//!
//! This module provides persistent storage for:
//! - Per-platform access tokens (encrypted at rest)
//! - The registered repository list, including `last_sync_time`
//! - String settings such as the sync interval
//!
//! The database is stored in XDG_DATA_HOME/repomirror/store.db by default

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::crypto::TokenCipher;
use crate::platform::Platform;
use crate::repository::{Repository, RepositoryUpdate};

/// Setting key holding the scheduler interval in minutes
pub const SYNC_INTERVAL_KEY: &str = "settings.syncIntervalMinutes";

/// Synchronous key-value dependency of the sync engine
pub trait CredentialStore: Send + Sync {
    fn get_token(&self, platform: Platform) -> Result<Option<String>>;
    fn set_token(&self, platform: Platform, token: &str) -> Result<()>;
    fn clear_token(&self, platform: Platform) -> Result<()>;

    fn list_repositories(&self) -> Result<Vec<Repository>>;
    fn get_repository(&self, id: &str) -> Result<Option<Repository>>;
    /// Insert or replace a repository
    fn add_repository(&self, repo: &Repository) -> Result<()>;
    /// Apply a partial update; `None` if the id is not registered
    fn update_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Option<Repository>>;
    /// Returns false if the id was not registered
    fn remove_repository(&self, id: &str) -> Result<bool>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite implementation of [`CredentialStore`]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: TokenCipher,
}

impl SqliteStore {
    /// Open or create the store at a specific path
    pub fn open_at(path: &Path, cipher: TokenCipher) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create store directory")?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;

        let store = Self::from_connection(conn, cipher)?;
        info!("Credential store opened at {}", path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory(cipher: TokenCipher) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory store")?;
        Self::from_connection(conn, cipher)
    }

    fn from_connection(conn: Connection, cipher: TokenCipher) -> Result<Self> {
        Self::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn initialize(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                platform TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                full_name TEXT NOT NULL,
                primary_platform TEXT NOT NULL,
                secondary_platform TEXT NOT NULL,
                sync_enabled INTEGER NOT NULL DEFAULT 1,
                last_sync_time TEXT,
                added_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_repos_enabled ON repositories(sync_enabled);
            "#,
        )
        .context("Failed to initialize store schema")?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Store connection lock poisoned"))
    }

    fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<Repository> {
        Ok(Repository {
            id: row.get(0)?,
            full_name: row.get(1)?,
            primary_platform: platform_column(row, 2)?,
            secondary_platform: platform_column(row, 3)?,
            sync_enabled: row.get::<_, i32>(4)? != 0,
            last_sync_time: row
                .get::<_, Option<String>>(5)?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
        })
    }

    fn query_repository(conn: &Connection, id: &str) -> Result<Option<Repository>> {
        conn.query_row(
            r#"
            SELECT id, full_name, primary_platform, secondary_platform, sync_enabled, last_sync_time
            FROM repositories
            WHERE id = ?1
            "#,
            params![id],
            Self::row_to_repository,
        )
        .optional()
        .context("Failed to query repository")
    }
}

impl CredentialStore for SqliteStore {
    fn get_token(&self, platform: Platform) -> Result<Option<String>> {
        let stored: Option<String> = self
            .conn()?
            .query_row(
                "SELECT token FROM tokens WHERE platform = ?1",
                params![platform.as_str()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query token")?;

        stored
            .map(|value| {
                self.cipher
                    .decrypt(&value)
                    .with_context(|| format!("Failed to decrypt {} token", platform))
            })
            .transpose()
    }

    fn set_token(&self, platform: Platform, token: &str) -> Result<()> {
        let encrypted = self.cipher.encrypt(token)?;
        self.conn()?
            .execute(
                r#"
                INSERT INTO tokens (platform, token, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(platform) DO UPDATE SET token = ?2, updated_at = ?3
                "#,
                params![platform.as_str(), encrypted, Utc::now().to_rfc3339()],
            )
            .context("Failed to store token")?;

        debug!("Stored {} token", platform);
        Ok(())
    }

    fn clear_token(&self, platform: Platform) -> Result<()> {
        self.conn()?
            .execute(
                "DELETE FROM tokens WHERE platform = ?1",
                params![platform.as_str()],
            )
            .context("Failed to clear token")?;
        Ok(())
    }

    fn list_repositories(&self) -> Result<Vec<Repository>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, full_name, primary_platform, secondary_platform, sync_enabled, last_sync_time
            FROM repositories
            ORDER BY added_at, id
            "#,
        )?;

        let repos = stmt
            .query_map([], Self::row_to_repository)
            .context("Failed to query repositories")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect repositories")?;

        Ok(repos)
    }

    fn get_repository(&self, id: &str) -> Result<Option<Repository>> {
        Self::query_repository(&*self.conn()?, id)
    }

    fn add_repository(&self, repo: &Repository) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO repositories (id, full_name, primary_platform, secondary_platform, sync_enabled, last_sync_time, added_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(id) DO UPDATE SET
                    full_name = ?2,
                    primary_platform = ?3,
                    secondary_platform = ?4,
                    sync_enabled = ?5,
                    last_sync_time = COALESCE(?6, last_sync_time)
                "#,
                params![
                    repo.id,
                    repo.full_name,
                    repo.primary_platform.as_str(),
                    repo.secondary_platform.as_str(),
                    repo.sync_enabled as i32,
                    repo.last_sync_time.map(|t| t.to_rfc3339()),
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to add repository")?;

        debug!("Registered repository {} ({})", repo.id, repo.full_name);
        Ok(())
    }

    fn update_repository(&self, id: &str, update: RepositoryUpdate) -> Result<Option<Repository>> {
        let conn = self.conn()?;
        let Some(mut repo) = Self::query_repository(&conn, id)? else {
            return Ok(None);
        };

        update.apply(&mut repo);

        conn.execute(
            "UPDATE repositories SET sync_enabled = ?2, last_sync_time = ?3 WHERE id = ?1",
            params![
                id,
                repo.sync_enabled as i32,
                repo.last_sync_time.map(|t| t.to_rfc3339()),
            ],
        )
        .context("Failed to update repository")?;

        Ok(Some(repo))
    }

    fn remove_repository(&self, id: &str) -> Result<bool> {
        let count = self
            .conn()?
            .execute("DELETE FROM repositories WHERE id = ?1", params![id])
            .context("Failed to remove repository")?;
        Ok(count > 0)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?
            .execute(
                r#"
                INSERT INTO settings (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = ?2
                "#,
                params![key, value],
            )
            .context("Failed to store setting")?;
        Ok(())
    }
}

/// Stored platform names must be known; an unknown one is never guessed
fn platform_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Platform> {
    let value: String = row.get(index)?;
    Platform::parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            format!("unknown platform {:?}", value).into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory(TokenCipher::new("test-key").unwrap()).unwrap()
    }

    fn repo(id: &str) -> Repository {
        Repository::new(id, format!("owner/{}", id), Platform::GitHub, Platform::Gitee)
    }

    #[test]
    fn test_store_initialization() {
        let store = store();
        assert!(store.list_repositories().unwrap().is_empty());
        assert!(store.get_token(Platform::GitHub).unwrap().is_none());
        assert!(store.get_setting(SYNC_INTERVAL_KEY).unwrap().is_none());
    }

    #[test]
    fn test_tokens_are_encrypted_at_rest() {
        let store = store();
        store.set_token(Platform::GitHub, "ghp_plain").unwrap();

        let raw: String = store
            .conn()
            .unwrap()
            .query_row(
                "SELECT token FROM tokens WHERE platform = 'github'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(!raw.contains("ghp_plain"));

        assert_eq!(
            store.get_token(Platform::GitHub).unwrap().as_deref(),
            Some("ghp_plain")
        );
        assert!(store.get_token(Platform::Gitee).unwrap().is_none());
    }

    #[test]
    fn test_token_replace_and_clear() {
        let store = store();
        store.set_token(Platform::Gitee, "first").unwrap();
        store.set_token(Platform::Gitee, "second").unwrap();
        assert_eq!(
            store.get_token(Platform::Gitee).unwrap().as_deref(),
            Some("second")
        );

        store.clear_token(Platform::Gitee).unwrap();
        assert!(store.get_token(Platform::Gitee).unwrap().is_none());
    }

    #[test]
    fn test_token_from_other_key_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        let store = SqliteStore::open_at(&path, TokenCipher::new("one").unwrap()).unwrap();
        store.set_token(Platform::GitHub, "secret").unwrap();
        drop(store);

        let reopened = SqliteStore::open_at(&path, TokenCipher::new("two").unwrap()).unwrap();
        assert!(reopened.get_token(Platform::GitHub).is_err());
    }

    #[test]
    fn test_repository_crud() {
        let store = store();
        store.add_repository(&repo("gh_1")).unwrap();
        store.add_repository(&repo("gh_2")).unwrap();

        let repos = store.list_repositories().unwrap();
        assert_eq!(repos.len(), 2);
        assert_eq!(repos[0].id, "gh_1");
        assert_eq!(repos[0].primary_platform, Platform::GitHub);
        assert_eq!(repos[0].secondary_platform, Platform::Gitee);

        assert!(store.remove_repository("gh_1").unwrap());
        assert!(!store.remove_repository("gh_1").unwrap());
        assert!(store.get_repository("gh_1").unwrap().is_none());
        assert!(store.get_repository("gh_2").unwrap().is_some());
    }

    #[test]
    fn test_update_repository() {
        let store = store();
        store.add_repository(&repo("gh_1")).unwrap();

        let when = Utc::now() - Duration::minutes(5);
        let updated = store
            .update_repository("gh_1", RepositoryUpdate::last_sync_time(when))
            .unwrap()
            .unwrap();
        assert_eq!(updated.last_sync_time, Some(when));

        store
            .update_repository("gh_1", RepositoryUpdate::sync_enabled(false))
            .unwrap();
        let stored = store.get_repository("gh_1").unwrap().unwrap();
        assert!(!stored.sync_enabled);
        assert_eq!(stored.last_sync_time, Some(when));

        assert!(store
            .update_repository("missing", RepositoryUpdate::sync_enabled(true))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_re_adding_keeps_last_sync_time() {
        let store = store();
        store.add_repository(&repo("gh_1")).unwrap();
        let when = Utc::now();
        store
            .update_repository("gh_1", RepositoryUpdate::last_sync_time(when))
            .unwrap();

        store.add_repository(&repo("gh_1")).unwrap();
        assert_eq!(
            store.get_repository("gh_1").unwrap().unwrap().last_sync_time,
            Some(when)
        );
    }

    #[test]
    fn test_settings() {
        let store = store();
        store.set_setting(SYNC_INTERVAL_KEY, "15").unwrap();
        store.set_setting(SYNC_INTERVAL_KEY, "20").unwrap();
        assert_eq!(
            store.get_setting(SYNC_INTERVAL_KEY).unwrap().as_deref(),
            Some("20")
        );
    }

    #[test]
    fn test_unknown_platform_is_an_error() {
        let store = store();
        store.add_repository(&repo("gh_1")).unwrap();
        store
            .conn()
            .unwrap()
            .execute(
                "UPDATE repositories SET secondary_platform = 'gitlab' WHERE id = 'gh_1'",
                [],
            )
            .unwrap();

        assert!(store.get_repository("gh_1").is_err());
        assert!(store.list_repositories().is_err());
    }
}
