use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use repomirror::config::LoggingConfig;
use repomirror::daemon::{running_daemon_pid, stop_daemon};
use repomirror::{
    Config, Daemon, HealthCheck, Platform, Repository, SyncEngine, SyncResult, SyncStatus,
};

#[derive(Parser)]
#[command(name = "repomirror")]
#[command(about = "Keep git repository mirrors in sync between hosting platforms")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the configuration file and prepare the workspace and store
    Init {
        /// Directory holding the mirror working directories
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Manage platform access tokens
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Manage registered repositories
    Repo {
        #[command(subcommand)]
        repo_command: RepoCommands,
    },

    /// Sync one repository, or every enabled repository with --all
    Sync {
        /// Repository id (e.g. gh_1296269)
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,

        /// Sync every enabled repository
        #[arg(long)]
        all: bool,
    },

    /// Show sync status
    ///
    /// Syncing and error states live in the process that runs the sync. A
    /// separate invocation reports Idle with the persisted last sync time,
    /// even while the daemon is syncing.
    Status {
        /// Repository id; all registered repositories if omitted
        id: Option<String>,
    },

    /// Get or set the scheduler interval
    Interval {
        #[command(subcommand)]
        interval_command: IntervalCommands,
    },

    /// Run the scheduler as a daemon
    Daemon {
        #[command(subcommand)]
        daemon_command: DaemonCommands,
    },

    /// System health check and diagnostics
    Doctor,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Store a token (read from stdin unless --token is given)
    Set {
        #[arg(value_enum)]
        platform: Platform,

        #[arg(long)]
        token: Option<String>,

        /// Validate the token against the platform API before storing it
        #[arg(long)]
        verify: bool,
    },

    /// Remove a stored token
    Clear {
        #[arg(value_enum)]
        platform: Platform,
    },

    /// Show which tokens are stored
    Status,

    /// Validate stored tokens against the platform APIs
    Test {
        #[arg(value_enum)]
        platform: Option<Platform>,
    },
}

#[derive(Subcommand)]
enum RepoCommands {
    /// List registered repositories
    List,

    /// Register a repository by owner/name
    Add {
        /// Repository in owner/name form
        full_name: String,

        /// Primary platform
        #[arg(long, value_enum, default_value = "github")]
        platform: Platform,

        /// Secondary platform
        #[arg(long, value_enum, default_value = "gitee")]
        secondary: Platform,
    },

    /// List repositories visible to the stored token on a platform
    Discover {
        #[arg(long, value_enum, default_value = "github")]
        platform: Platform,
    },

    /// Unregister a repository (its working directory is kept)
    Remove { id: String },

    /// Include a repository in scheduled syncs
    Enable { id: String },

    /// Exclude a repository from scheduled syncs
    Disable { id: String },
}

#[derive(Subcommand)]
enum IntervalCommands {
    /// Show the interval in minutes
    Get,

    /// Set the interval in minutes
    Set {
        #[arg(allow_negative_numbers = true)]
        minutes: i64,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Start the daemon
    Start {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },

    /// Stop running daemon
    Stop,

    /// Show daemon status
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;
    init_logging(cli.verbose, &config.logging)?;
    info!("Starting repomirror v{}", env!("CARGO_PKG_VERSION"));

    // Forking is only safe before the runtime starts its worker threads
    if let Commands::Daemon {
        daemon_command: DaemonCommands::Start { foreground: false },
    } = &cli.command
    {
        return cmd_daemon_background(config);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(run(cli, config))
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Init { workspace } => cmd_init(workspace, cli.config.as_deref(), config),
        Commands::Auth { auth_command } => cmd_auth(auth_command, &config, json).await,
        Commands::Repo { repo_command } => cmd_repo(repo_command, &config, json).await,
        Commands::Sync { id, all } => cmd_sync(id, all, &config, json).await,
        Commands::Status { id } => cmd_status(id, &config, json),
        Commands::Interval { interval_command } => cmd_interval(interval_command, &config, json),
        Commands::Daemon { daemon_command } => cmd_daemon(daemon_command, config, json).await,
        Commands::Doctor => cmd_doctor(&config, json),
    }
}

/// Initialize logging from the configuration; `--verbose` and RUST_LOG take precedence
fn init_logging(verbose: bool, logging: &LoggingConfig) -> Result<()> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr so stdout stays parseable with --json
    let layer = fmt::layer()
        .with_ansi(logging.color)
        .with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(filter);
    match logging.format.as_str() {
        "pretty" => registry.with(layer.pretty()).init(),
        "full" => registry.with(layer).init(),
        _ => registry.with(layer.compact()).init(),
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) if path.exists() => Config::load(path),
        Some(_) => {
            let mut config = Config::default();
            config.expand_paths()?;
            Ok(config)
        }
        None => Config::load_or_default(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

/// Print an engine result; failures become a non-zero exit
fn report(result: &SyncResult, json: bool) -> Result<()> {
    if json {
        print_json(result)?;
    } else if result.success {
        println!("✅ {}", result.message.as_deref().unwrap_or("Done"));
    } else {
        println!("❌ {}", result.error.as_deref().unwrap_or("Failed"));
    }

    if result.success {
        Ok(())
    } else {
        bail!(
            "{}",
            result.error.clone().unwrap_or_else(|| "Operation failed".to_string())
        )
    }
}

fn format_time(time: Option<chrono::DateTime<chrono::Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "never".to_string())
}

/// Write configuration and prepare the workspace, key and store
fn cmd_init(workspace: Option<String>, config_path: Option<&Path>, config: Config) -> Result<()> {
    info!("Initializing repomirror...");

    let mut new_config = config;
    if let Some(workspace) = workspace {
        new_config.workspace_directory = workspace;
        // Later invocations may run from another directory
        new_config.pin_relative_workspace()?;
    }

    let config_path = match config_path {
        Some(path) => path.to_path_buf(),
        None => Config::default_config_path()?,
    };
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    new_config.save(&config_path)?;
    new_config.expand_paths()?;

    std::fs::create_dir_all(new_config.workspace_path())
        .context("Failed to create workspace directory")?;

    // Creates the key file and the database schema
    SyncEngine::from_config(&new_config)?;

    println!("✅ repomirror initialized successfully!");
    println!("   Config: {:?}", config_path);
    println!("   Workspace: {}", new_config.workspace_directory);
    println!("   Store: {}", new_config.store_path);
    println!("   Next: repomirror auth set github && repomirror auth set gitee");

    Ok(())
}

fn read_token(platform: Platform) -> Result<String> {
    eprint!("Enter {} token: ", platform);
    std::io::stderr().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read token from stdin")?;
    Ok(line.trim().to_string())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenStatus {
    platform: Platform,
    set: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    login: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Handle authentication commands
async fn cmd_auth(auth_command: AuthCommands, config: &Config, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config)?;
    let store = engine.store();

    match auth_command {
        AuthCommands::Set {
            platform,
            token,
            verify,
        } => {
            let token = match token {
                Some(token) => token.trim().to_string(),
                None => read_token(platform)?,
            };
            if token.is_empty() {
                bail!("Token must not be empty");
            }

            if verify {
                let login = engine.platforms().validate_token(platform, &token).await?;
                println!("🔑 Token belongs to {}", login);
            }

            store.set_token(platform, &token)?;
            println!("✅ {} token stored", platform);
        }

        AuthCommands::Clear { platform } => {
            store.clear_token(platform)?;
            println!("✅ {} token removed", platform);
        }

        AuthCommands::Status => {
            let mut statuses = Vec::new();
            for platform in Platform::ALL {
                let set = store.get_token(platform)?.is_some_and(|t| !t.is_empty());
                statuses.push(TokenStatus {
                    platform,
                    set,
                    login: None,
                    error: None,
                });
            }

            if json {
                return print_json(&statuses);
            }
            for status in statuses {
                let icon = if status.set { "✅" } else { "❌" };
                let state = if status.set { "set" } else { "not set" };
                println!("   {} {}: {}", icon, status.platform, state);
            }
        }

        AuthCommands::Test { platform } => {
            let platforms = match platform {
                Some(platform) => vec![platform],
                None => Platform::ALL.to_vec(),
            };

            let mut statuses = Vec::new();
            for platform in platforms {
                let status = match store.get_token(platform)? {
                    Some(token) => match engine.platforms().validate_token(platform, &token).await {
                        Ok(login) => TokenStatus {
                            platform,
                            set: true,
                            login: Some(login),
                            error: None,
                        },
                        Err(e) => TokenStatus {
                            platform,
                            set: true,
                            login: None,
                            error: Some(format!("{:#}", e)),
                        },
                    },
                    None => TokenStatus {
                        platform,
                        set: false,
                        login: None,
                        error: Some("not set".to_string()),
                    },
                };
                statuses.push(status);
            }

            let all_valid = statuses.iter().all(|s| s.login.is_some());
            if json {
                print_json(&statuses)?;
            } else {
                for status in &statuses {
                    match (&status.login, &status.error) {
                        (Some(login), _) => {
                            println!("   ✅ {}: authenticated as {}", status.platform, login)
                        }
                        (None, Some(error)) => println!("   ❌ {}: {}", status.platform, error),
                        (None, None) => println!("   ❌ {}: invalid", status.platform),
                    }
                }
            }

            if !all_valid {
                bail!("Token validation failed");
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryListing<'a> {
    #[serde(flatten)]
    repository: &'a Repository,
    status: SyncStatus,
}

/// Handle repository commands
async fn cmd_repo(repo_command: RepoCommands, config: &Config, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config)?;

    match repo_command {
        RepoCommands::List => {
            let repositories = engine.list_repositories()?;
            if json {
                return print_json(&repositories);
            }

            println!("Repositories ({}):", repositories.len());
            for repo in repositories {
                let icon = if repo.sync_enabled { "📁" } else { "⏸️ " };
                println!(
                    "  {} {} {} ({} → {}, last sync: {})",
                    icon,
                    repo.id,
                    repo.full_name,
                    repo.primary_platform,
                    repo.secondary_platform,
                    format_time(repo.last_sync_time)
                );
            }
        }

        RepoCommands::Add {
            full_name,
            platform,
            secondary,
        } => {
            if platform == secondary {
                bail!("Primary and secondary platform must differ");
            }
            let Some(token) = engine.store().get_token(platform)? else {
                bail!(
                    "No {} token set. Run: repomirror auth set {}",
                    platform,
                    platform.as_str()
                );
            };

            let remote = engine
                .platforms()
                .fetch_repository(platform, &full_name, &token)
                .await?;
            let repo = engine.register_repository(remote.into_repository(secondary))?;

            if json {
                return print_json(&repo);
            }
            println!("✅ Registered {} as {}", repo.full_name, repo.id);
        }

        RepoCommands::Discover { platform } => {
            let Some(token) = engine.store().get_token(platform)? else {
                bail!(
                    "No {} token set. Run: repomirror auth set {}",
                    platform,
                    platform.as_str()
                );
            };

            println!("🔍 Discovering repositories on {}...", platform);
            let remote = engine.platforms().list_repositories(platform, &token).await?;
            if json {
                return print_json(&remote);
            }

            let registered: Vec<String> = engine
                .list_repositories()?
                .into_iter()
                .map(|r| r.id)
                .collect();

            println!("   Found {} repositories", remote.len());
            for repo in remote {
                let id = repo.repository_id();
                let marker = if registered.contains(&id) { "✅" } else { "  " };
                let visibility = if repo.private { " (private)" } else { "" };
                println!("  {} {} {}{}", marker, id, repo.full_name, visibility);
                if let Some(description) = &repo.description {
                    println!("        📝 {}", description);
                }
            }
        }

        RepoCommands::Remove { id } => {
            engine.unregister_repository(&id)?;
            println!("✅ Removed {}", id);
            println!("   Working directory kept at {}", engine.workdir(&id).display());
        }

        RepoCommands::Enable { id } => {
            let repo = engine.set_sync_enabled(&id, true)?;
            println!("✅ Sync enabled for {}", repo.full_name);
        }

        RepoCommands::Disable { id } => {
            let repo = engine.set_sync_enabled(&id, false)?;
            println!("⏸️  Sync disabled for {}", repo.full_name);
        }
    }

    Ok(())
}

/// Sync one or all repositories; Ctrl+C stops in-flight syncs
async fn cmd_sync(id: Option<String>, all: bool, config: &Config, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config)?;

    let stopper = engine.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            for id in stopper.active_syncs() {
                stopper.stop_sync(&id);
            }
        }
    });

    let outcome = match (id, all) {
        (Some(id), _) => {
            if !json {
                println!("🔄 Syncing {}...", id);
            }
            let result = engine.start_sync(&id).await;
            report(&result, json)
        }
        (None, true) => {
            if !json {
                println!("🔄 Syncing all enabled repositories...");
            }
            let summary = engine.sync_enabled_repositories().await?;

            if json {
                print_json(&summary)?;
            } else {
                println!("\n🎉 Synchronization Complete!");
                println!("   📊 Total repositories: {}", summary.total_repositories);
                println!("   ✅ Successful: {}", summary.successful_operations);
                println!("   ❌ Failed: {}", summary.failed_operations);
                println!("   ⏭️  Skipped: {}", summary.skipped_operations);
                println!("   ⏱️  Duration: {:.2}s", summary.duration.as_secs_f64());

                for entry in summary.results.iter().filter(|r| !r.result.success) {
                    println!(
                        "   ❌ {}: {}",
                        entry.repository_id,
                        entry.result.error.as_deref().unwrap_or("failed")
                    );
                }
            }

            if summary.failed_operations > 0 {
                Err(anyhow::anyhow!(
                    "{} repositories failed to sync",
                    summary.failed_operations
                ))
            } else {
                Ok(())
            }
        }
        (None, false) => Err(anyhow::anyhow!("Specify a repository id or --all")),
    };

    ctrl_c.abort();
    outcome
}

/// Show status of one or all repositories
fn cmd_status(id: Option<String>, config: &Config, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config)?;

    if let Some(id) = id {
        let status = engine.get_status(&id);
        if json {
            return print_json(&status);
        }
        print_status(&id, &status);
        return Ok(());
    }

    let repositories = engine.list_repositories()?;
    let listings: Vec<RepositoryListing> = repositories
        .iter()
        .map(|repository| RepositoryListing {
            repository,
            status: engine.get_status(&repository.id),
        })
        .collect();

    if json {
        return print_json(&listings);
    }
    for listing in &listings {
        print_status(&listing.repository.id, &listing.status);
    }
    Ok(())
}

fn print_status(id: &str, status: &SyncStatus) {
    let state = serde_json::to_value(status.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();
    print!("  {} {}", id, state);
    if let Some(progress) = status.progress {
        print!(" ({}%)", progress);
    }
    println!(", last sync: {}", format_time(status.last_sync_time));
    if let Some(error) = &status.last_error {
        println!("     ❌ {}", error);
    }
}

fn cmd_interval(interval_command: IntervalCommands, config: &Config, json: bool) -> Result<()> {
    let engine = SyncEngine::from_config(config)?;

    match interval_command {
        IntervalCommands::Get => {
            let minutes = engine.get_interval()?;
            if json {
                print_json(&serde_json::json!({ "minutes": minutes }))?;
            } else {
                println!("⏰ Sync interval: {} minutes", minutes);
            }
            Ok(())
        }
        IntervalCommands::Set { minutes } => {
            let result = engine
                .set_interval(minutes)
                .map(|()| format!("Sync interval set to {} minutes", minutes));
            report(&SyncResult::from(result), json)
        }
    }
}

/// Daemonize, then run the scheduler on a fresh runtime
#[cfg(unix)]
fn cmd_daemon_background(config: Config) -> Result<()> {
    if let Some(pid) = running_daemon_pid(&config)? {
        println!("⚠️  Daemon is already running (PID {})", pid);
        println!("   Use 'repomirror daemon stop' to stop it first");
        return Ok(());
    }

    println!("🚀 Starting repomirror daemon...");
    println!("   PID file: {}", config.daemon.pid_file);
    println!("   Log file: {}", config.daemon.log_file);

    let engine = SyncEngine::from_config(&config)?;
    let daemon = Daemon::new(config, engine);
    daemon.daemonize()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(daemon.run())
}

#[cfg(not(unix))]
fn cmd_daemon_background(_config: Config) -> Result<()> {
    println!("❌ Background daemon mode not supported on this platform");
    println!("   Use --foreground to run in foreground mode");
    Ok(())
}

/// Handle daemon commands
async fn cmd_daemon(daemon_command: DaemonCommands, config: Config, json: bool) -> Result<()> {
    match daemon_command {
        DaemonCommands::Start { .. } => {
            if let Some(pid) = running_daemon_pid(&config)? {
                println!("⚠️  Daemon is already running (PID {})", pid);
                return Ok(());
            }

            println!("🖥️  Running in foreground mode (Ctrl+C to stop)");
            let engine = SyncEngine::from_config(&config)?;
            Daemon::new(config, engine).run().await?;
        }

        DaemonCommands::Stop => {
            println!("🛑 Stopping repomirror daemon...");
            if stop_daemon(&config)? {
                println!("✅ Daemon stop signal sent");
            } else {
                println!("⚠️  No daemon appears to be running");
            }
        }

        DaemonCommands::Status => {
            let pid = running_daemon_pid(&config)?;
            let engine = SyncEngine::from_config(&config)?;
            let interval = engine.get_interval()?;

            if json {
                return print_json(&serde_json::json!({
                    "running": pid.is_some(),
                    "pid": pid,
                    "intervalMinutes": interval,
                }));
            }

            println!("📊 repomirror Daemon Status");
            match pid {
                Some(pid) => {
                    println!("   🟢 Status: Running (PID {})", pid);
                    println!("   🔄 Sync interval: {} minutes", interval);
                    if !config.daemon.log_file.is_empty() {
                        println!("   📄 Log file: {}", config.daemon.log_file);
                    }
                }
                None => {
                    println!("   🔴 Status: Not running");
                    println!("   💡 Use 'repomirror daemon start' to start the daemon");
                }
            }
        }
    }

    Ok(())
}

/// System health check and diagnostics
fn cmd_doctor(config: &Config, json: bool) -> Result<()> {
    let health = HealthCheck::run(config);

    if json {
        print_json(&health)?;
    } else {
        print_health_report(&health);
    }

    if health.all_passed() {
        Ok(())
    } else {
        bail!("{} health checks failed", health.errors().len())
    }
}

/// Print health check report to stdout
fn print_health_report(health: &HealthCheck) {
    use repomirror::health::CheckResult;

    fn print_check(name: &str, result: &CheckResult) {
        println!("{}:", name);
        let icon = if result.passed {
            if result.is_warning {
                "⚠️ "
            } else {
                "✅"
            }
        } else {
            "❌"
        };
        println!("  {} {}", icon, result.message);
        if let Some(details) = &result.details {
            for line in details.lines() {
                println!("     {}", line);
            }
        }
    }

    println!("🔍 repomirror System Diagnostics");
    println!();

    for (name, result) in health.all_checks() {
        print_check(name, result);
        println!();
    }

    if health.all_passed() {
        println!("✅ All checks passed");
    } else {
        println!("❌ Some checks failed");
    }
}
