use anyhow::{Context, Result};
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform::Platform;

/// Main configuration structure for repomirror
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Directory holding one mirror working directory per repository
    #[serde(default = "default_workspace_directory")]
    pub workspace_directory: String,

    /// SQLite database holding tokens, repositories and settings
    #[serde(default = "default_store_path")]
    pub store_path: String,

    /// Master key file used when REPOMIRROR_ENCRYPTION_KEY is not set
    #[serde(default = "default_key_file")]
    pub key_file: String,

    /// Hosting platform endpoints
    #[serde(default)]
    pub platforms: PlatformsConfig,

    /// Synchronization behavior settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoints for both supported platforms
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PlatformsConfig {
    #[serde(default = "default_github_endpoint")]
    pub github: PlatformEndpoint,

    #[serde(default = "default_gitee_endpoint")]
    pub gitee: PlatformEndpoint,
}

/// Git host and REST API base of one platform
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PlatformEndpoint {
    /// Host used in clone and push URLs
    pub host: String,

    /// Base URL of the REST API
    pub api_url: String,
}

/// Synchronization configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    /// Timeout for each git step in seconds
    #[serde(default = "default_step_timeout")]
    pub step_timeout: u64,

    /// Interval used until one is stored with `interval set`
    #[serde(default = "default_interval_minutes")]
    pub default_interval_minutes: u32,

    /// Maximum repositories synced at once by a scheduled batch
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Name of the git remote pointing at the secondary platform
    #[serde(default = "default_secondary_remote")]
    pub secondary_remote: String,
}

/// Daemon configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DaemonConfig {
    /// PID file location
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log file location
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"

    /// Enable colored output
    #[serde(default = "default_true")]
    pub color: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn data_home() -> String {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        format!("{}/repomirror", data_home)
    } else if let Ok(home) = std::env::var("HOME") {
        format!("{}/.local/share/repomirror", home)
    } else {
        "/tmp/repomirror".to_string()
    }
}

fn default_workspace_directory() -> String {
    format!("{}/repos", data_home())
}
fn default_store_path() -> String {
    format!("{}/store.db", data_home())
}
fn default_key_file() -> String {
    format!("{}/master.key", data_home())
}
fn default_github_endpoint() -> PlatformEndpoint {
    PlatformEndpoint {
        host: "github.com".to_string(),
        api_url: "https://api.github.com".to_string(),
    }
}
fn default_gitee_endpoint() -> PlatformEndpoint {
    PlatformEndpoint {
        host: "gitee.com".to_string(),
        api_url: "https://gitee.com/api/v5".to_string(),
    }
}
fn default_step_timeout() -> u64 {
    600
}
fn default_interval_minutes() -> u32 {
    30
}
fn default_max_parallel() -> usize {
    4
}
fn default_secondary_remote() -> String {
    "secondary".to_string()
}
fn default_pid_file() -> String {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        format!("{}/repomirror.pid", runtime_dir)
    } else {
        "/tmp/repomirror.pid".to_string()
    }
}
fn default_log_file() -> String {
    format!("{}/daemon.log", data_home())
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

// Default implementations
impl Default for PlatformsConfig {
    fn default() -> Self {
        Self {
            github: default_github_endpoint(),
            gitee: default_gitee_endpoint(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            step_timeout: default_step_timeout(),
            default_interval_minutes: default_interval_minutes(),
            max_parallel: default_max_parallel(),
            secondary_remote: default_secondary_remote(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: default_true(),
        }
    }
}

impl PlatformsConfig {
    /// Endpoint settings for a platform
    pub fn endpoint(&self, platform: Platform) -> &PlatformEndpoint {
        match platform {
            Platform::GitHub => &self.github,
            Platform::Gitee => &self.gitee,
        }
    }
}

impl SyncConfig {
    /// Per-step timeout as a Duration
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout)
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let mut config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;
            config.expand_paths()?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let mut config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        // Expand environment variables in paths
        config.expand_paths()?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repomirror").join("config.yml"))
    }

    /// Expand environment variables in configuration paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.workspace_directory = shellexpand::full(&self.workspace_directory)
            .context("Failed to expand workspace_directory path")?
            .into_owned();

        self.store_path = shellexpand::full(&self.store_path)
            .context("Failed to expand store_path path")?
            .into_owned();

        self.key_file = shellexpand::full(&self.key_file)
            .context("Failed to expand key_file path")?
            .into_owned();

        self.daemon.pid_file = shellexpand::full(&self.daemon.pid_file)
            .context("Failed to expand pid_file path")?
            .into_owned();

        self.daemon.log_file = shellexpand::full(&self.daemon.log_file)
            .context("Failed to expand log_file path")?
            .into_owned();

        self.pin_relative_workspace()
    }

    /// Anchor a relative workspace to the current directory.
    ///
    /// Values still starting with `~` or `$` are left for [`Config::expand_paths`].
    pub fn pin_relative_workspace(&mut self) -> Result<()> {
        let raw = self.workspace_directory.as_str();
        if raw.starts_with('~') || raw.starts_with('$') || Path::new(raw).is_absolute() {
            return Ok(());
        }

        let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
        let relative = raw.strip_prefix("./").unwrap_or(raw);
        self.workspace_directory = cwd.join(relative).to_string_lossy().into_owned();
        Ok(())
    }

    /// Workspace directory as a path
    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(&self.workspace_directory)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_directory: default_workspace_directory(),
            store_path: default_store_path(),
            key_file: default_key_file(),
            platforms: PlatformsConfig::default(),
            sync: SyncConfig::default(),
            daemon: DaemonConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
