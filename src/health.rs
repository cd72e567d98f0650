//! System health checks for repomirror
//!
//! Preflight checks run by `repomirror doctor` to verify the system can sync
//! before the scheduler is started.

use crate::crypto::TokenCipher;
use crate::platform::Platform;
use crate::store::{CredentialStore, SqliteStore};
use crate::Config;
use serde::Serialize;
use std::path::Path;

/// Result of system health checks
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Git installation status
    pub git: CheckResult,
    /// Credential store can be opened and decrypted
    pub store: CheckResult,
    /// Tokens for both platforms are present
    pub tokens: CheckResult,
    /// Workspace directory status (warning if it will be created on first sync)
    pub workspace: CheckResult,
}

/// Result of an individual health check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub passed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub is_warning: bool,
}

impl CheckResult {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn ok_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: None,
            is_warning: false,
        }
    }

    fn error_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            details: Some(details.into()),
            is_warning: false,
        }
    }

    fn warning_with_details(message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            details: Some(details.into()),
            is_warning: true,
        }
    }
}

impl HealthCheck {
    /// Run all health checks
    pub fn run(config: &Config) -> Self {
        let store = TokenCipher::from_env_or_file(Path::new(&config.key_file))
            .and_then(|cipher| SqliteStore::open_at(Path::new(&config.store_path), cipher));

        let (store_check, tokens_check) = match store {
            Ok(store) => (
                CheckResult::ok_with_details("Credential store opened", config.store_path.clone()),
                Self::check_tokens(&store),
            ),
            Err(e) => (
                CheckResult::error_with_details("Credential store unavailable", format!("{:#}", e)),
                CheckResult::error("Tokens cannot be read without the credential store"),
            ),
        };

        Self {
            git: Self::check_git(),
            store: store_check,
            tokens: tokens_check,
            workspace: Self::check_workspace(config),
        }
    }

    /// Check if all required checks passed (excludes warnings)
    pub fn all_passed(&self) -> bool {
        self.all_checks().iter().all(|(_, r)| r.passed)
    }

    /// Get list of failed checks (errors only, not warnings)
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| !r.passed && !r.is_warning)
            .collect()
    }

    /// Get list of warnings
    pub fn warnings(&self) -> Vec<&CheckResult> {
        self.all_checks()
            .into_iter()
            .map(|(_, r)| r)
            .filter(|r| r.is_warning)
            .collect()
    }

    /// Check git installation
    fn check_git() -> CheckResult {
        match std::process::Command::new("git").arg("--version").output() {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                CheckResult::ok_with_details("Git installed", version.trim().to_string())
            }
            Ok(_) => CheckResult::error("Git command failed"),
            Err(_) => CheckResult::error_with_details(
                "Git not found in PATH",
                "Install git: https://git-scm.com/downloads",
            ),
        }
    }

    /// Check that both platform tokens are stored
    fn check_tokens(store: &dyn CredentialStore) -> CheckResult {
        let mut missing = Vec::new();
        for platform in Platform::ALL {
            match store.get_token(platform) {
                Ok(Some(token)) if !token.is_empty() => {}
                Ok(_) => missing.push(platform.display_name()),
                Err(e) => {
                    return CheckResult::error_with_details(
                        format!("{} token cannot be decrypted", platform),
                        format!("{:#}\nRe-enter it with: repomirror auth set {}", e, platform.as_str()),
                    )
                }
            }
        }

        if missing.is_empty() {
            CheckResult::ok("GitHub and Gitee tokens set")
        } else {
            CheckResult::error_with_details(
                format!("Missing tokens: {}", missing.join(", ")),
                "Run: repomirror auth set <github|gitee>",
            )
        }
    }

    /// Check the workspace directory exists or can be created
    fn check_workspace(config: &Config) -> CheckResult {
        let path = Path::new(&config.workspace_directory);
        if path.is_dir() {
            return CheckResult::ok_with_details(
                "Workspace directory exists",
                config.workspace_directory.clone(),
            );
        }
        if path.exists() {
            return CheckResult::error_with_details(
                "Workspace path is not a directory",
                config.workspace_directory.clone(),
            );
        }

        // Nearest existing ancestor decides whether it can be created
        let writable = path
            .ancestors()
            .find(|p| p.exists())
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false);

        if writable {
            CheckResult::warning_with_details(
                "Workspace directory will be created on first sync",
                config.workspace_directory.clone(),
            )
        } else {
            CheckResult::error_with_details(
                "Workspace directory cannot be created",
                format!("Run: mkdir -p {}", config.workspace_directory),
            )
        }
    }

    /// Get all checks as a slice for iteration
    pub fn all_checks(&self) -> [(&'static str, &CheckResult); 4] {
        [
            ("Git Installation", &self.git),
            ("Credential Store", &self.store),
            ("Platform Tokens", &self.tokens),
            ("Workspace Directory", &self.workspace),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn passing() -> HealthCheck {
        HealthCheck {
            git: CheckResult::ok("Git OK"),
            store: CheckResult::ok("Store OK"),
            tokens: CheckResult::ok("Tokens OK"),
            workspace: CheckResult::ok("Dir OK"),
        }
    }

    fn memory_store() -> SqliteStore {
        SqliteStore::open_in_memory(TokenCipher::new("k").unwrap()).unwrap()
    }

    #[test]
    fn test_check_result_constructors() {
        let result = CheckResult::ok("Test passed");
        assert!(result.passed && !result.is_warning && result.details.is_none());

        let result = CheckResult::warning_with_details("Test warning", "Warning details");
        assert!(result.passed); // Warnings still "pass"
        assert!(result.is_warning);

        let result = CheckResult::error_with_details("Test failed", "Error details");
        assert!(!result.passed);
        assert_eq!(result.details, Some("Error details".to_string()));
    }

    #[test]
    fn test_tokens_check() {
        let store = memory_store();
        let result = HealthCheck::check_tokens(&store);
        assert!(!result.passed);
        assert!(result.message.contains("GitHub"));
        assert!(result.message.contains("Gitee"));

        store.set_token(Platform::GitHub, "gh").unwrap();
        let result = HealthCheck::check_tokens(&store);
        assert!(!result.passed);
        assert!(!result.message.contains("GitHub"));

        store.set_token(Platform::Gitee, "gt").unwrap();
        assert!(HealthCheck::check_tokens(&store).passed);
    }

    #[test]
    fn test_workspace_existing() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workspace_directory = dir.path().to_string_lossy().to_string();

        let result = HealthCheck::check_workspace(&config);
        assert!(result.passed);
        assert!(!result.is_warning);
    }

    #[test]
    fn test_workspace_creatable() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.workspace_directory = dir.path().join("a/b").to_string_lossy().to_string();

        let result = HealthCheck::check_workspace(&config);
        assert!(result.passed);
        assert!(result.is_warning);
    }

    #[test]
    fn test_workspace_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();

        let mut config = Config::default();
        config.workspace_directory = file.to_string_lossy().to_string();
        assert!(!HealthCheck::check_workspace(&config).passed);
    }

    #[test]
    fn test_run_with_temp_paths() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.store_path = dir.path().join("store.db").to_string_lossy().to_string();
        config.key_file = dir.path().join("master.key").to_string_lossy().to_string();
        config.workspace_directory = dir.path().to_string_lossy().to_string();

        let health = HealthCheck::run(&config);
        assert!(health.store.passed);
        assert!(health.workspace.passed);
        // Fresh store has no tokens
        assert!(!health.tokens.passed);
        assert!(!health.all_passed());
    }

    #[test]
    fn test_all_passed_and_warnings() {
        let mut health = passing();
        assert!(health.all_passed());

        health.workspace = CheckResult::warning_with_details("Will be created", "/x");
        assert!(health.all_passed());
        assert_eq!(health.warnings().len(), 1);

        health.git = CheckResult::error("Git missing");
        assert!(!health.all_passed());
        assert_eq!(health.errors().len(), 1);
    }

    #[test]
    fn test_all_checks_returns_all_four() {
        let health = passing();
        let checks = health.all_checks();
        assert_eq!(checks[0].0, "Git Installation");
        assert_eq!(checks[1].0, "Credential Store");
        assert_eq!(checks[2].0, "Platform Tokens");
        assert_eq!(checks[3].0, "Workspace Directory");
    }
}
