//! Integration tests for the repomirror CLI
//!
//! These run the built binary against an isolated config, store and workspace.

mod common;

use predicates::prelude::*;

use common::{stderr, stdout, CliEnvironment};

fn json(output: &std::process::Output) -> serde_json::Value {
    serde_json::from_str(&stdout(output)).expect("stdout is not JSON")
}

#[test]
fn test_cli_help() {
    let env = CliEnvironment::new();
    let output = env.run(&["--help"]);

    assert!(output.status.success());
    let stdout = stdout(&output);
    for command in ["init", "auth", "repo", "sync", "status", "interval", "daemon", "doctor"] {
        assert!(stdout.contains(command), "help is missing {}", command);
    }
}

#[test]
fn test_cli_version() {
    let env = CliEnvironment::new();
    let output = env.run(&["--version"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("repomirror"));
}

#[test]
fn test_init_creates_workspace_store_and_key() {
    let env = CliEnvironment::new();
    let output = env.run(&["init"]);
    assert!(output.status.success(), "init failed: {}", stderr(&output));
    assert!(stdout(&output).contains("initialized"));

    let is_file = predicate::path::is_file();
    assert!(predicate::path::is_dir().eval(&env.path("repos")));
    assert!(is_file.eval(&env.path("data/store.db")));
    assert!(is_file.eval(&env.path("data/master.key")));
}

#[test]
fn test_init_pins_relative_workspace() {
    let env = CliEnvironment::new();
    let output = env.run(&["init", "--workspace", "./mirrors"]);
    assert!(output.status.success(), "init failed: {}", stderr(&output));
    assert!(predicate::path::is_dir().eval(&env.path("mirrors")));

    let saved = std::fs::read_to_string(&env.config_path).unwrap();
    assert!(!saved.contains("./mirrors"));
    assert!(saved.contains("/mirrors"));

    // Resolved against the init directory, not the caller's
    let elsewhere = env.path("elsewhere");
    std::fs::create_dir_all(&elsewhere).unwrap();
    let output = env.run_from(&elsewhere, &["doctor", "--json"]);
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["workspace"]["message"], "Workspace directory exists");
}

#[test]
fn test_auth_set_and_status() {
    let env = CliEnvironment::new();

    let output = env.run(&["auth", "set", "github", "--token", "ghp_secret"]);
    assert!(output.status.success(), "auth set failed: {}", stderr(&output));
    assert!(!stdout(&output).contains("ghp_secret"));

    let output = env.run(&["auth", "status", "--json"]);
    assert!(output.status.success());
    assert_eq!(
        json(&output),
        serde_json::json!([
            {"platform": "github", "set": true},
            {"platform": "gitee", "set": false},
        ])
    );

    // Tokens are encrypted at rest
    let raw = std::fs::read(env.path("data/store.db")).unwrap();
    assert!(!raw.windows(b"ghp_secret".len()).any(|w| w == b"ghp_secret"));

    let output = env.run(&["auth", "clear", "github"]);
    assert!(output.status.success());
    let output = env.run(&["auth", "status", "--json"]);
    assert_eq!(json(&output)[0]["set"], serde_json::json!(false));
}

#[test]
fn test_auth_rejects_empty_token() {
    let env = CliEnvironment::new();
    let output = env.run(&["auth", "set", "gitee", "--token", "  "]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("must not be empty"));
}

#[test]
fn test_interval_set_and_get() {
    let env = CliEnvironment::new();

    let output = env.run(&["interval", "get", "--json"]);
    assert!(output.status.success());
    assert_eq!(json(&output)["minutes"], serde_json::json!(30));

    let output = env.run(&["interval", "set", "15"]);
    assert!(output.status.success(), "interval set failed: {}", stderr(&output));

    let output = env.run(&["interval", "get", "--json"]);
    assert_eq!(json(&output)["minutes"], serde_json::json!(15));
}

#[test]
fn test_interval_rejects_non_positive() {
    let env = CliEnvironment::new();
    env.run(&["interval", "set", "20"]);

    for minutes in ["0", "-5"] {
        let output = env.run(&["interval", "set", minutes, "--json"]);
        assert!(!output.status.success());
        assert_eq!(
            json(&output),
            serde_json::json!({"success": false, "error": "INVALID_INTERVAL"})
        );
    }

    let output = env.run(&["interval", "get", "--json"]);
    assert_eq!(json(&output)["minutes"], serde_json::json!(20));
}

#[test]
fn test_sync_unknown_repository() {
    let env = CliEnvironment::new();
    let output = env.run(&["sync", "gh_404", "--json"]);

    assert!(!output.status.success());
    assert_eq!(
        json(&output),
        serde_json::json!({"success": false, "error": "REPOSITORY_NOT_FOUND"})
    );
}

#[test]
fn test_sync_requires_id_or_all() {
    let env = CliEnvironment::new();
    let output = env.run(&["sync"]);
    assert!(!output.status.success());
}

#[test]
fn test_status_of_unknown_repository_is_idle() {
    let env = CliEnvironment::new();
    let output = env.run(&["status", "gh_1", "--json"]);

    assert!(output.status.success());
    assert_eq!(json(&output), serde_json::json!({"state": "idle"}));
}

#[test]
fn test_status_help_explains_process_scope() {
    let env = CliEnvironment::new();
    let output = env.run(&["status", "--help"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("persisted last sync time"));
}

#[test]
fn test_repo_list_starts_empty() {
    let env = CliEnvironment::new();

    let output = env.run(&["repo", "list", "--json"]);
    assert!(output.status.success());
    assert_eq!(json(&output), serde_json::json!([]));

    let output = env.run(&["repo", "list"]);
    assert!(stdout(&output).contains("Repositories (0)"));
}

#[test]
fn test_repo_add_requires_token() {
    let env = CliEnvironment::new();
    let output = env.run(&["repo", "add", "octocat/Hello-World"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("No GitHub token set"));
}

#[test]
fn test_repo_remove_unknown() {
    let env = CliEnvironment::new();
    let output = env.run(&["repo", "remove", "gh_404"]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("Repository not found"));
}

#[test]
fn test_doctor_command() {
    let env = CliEnvironment::new();
    let output = env.run(&["doctor"]);

    // No tokens are stored, so the check fails but still reports
    assert!(!output.status.success());
    let stdout = stdout(&output);
    assert!(stdout.contains("System Diagnostics"));
    assert!(stdout.contains("Git Installation"));
    assert!(stdout.contains("Missing tokens"));
}

#[test]
fn test_daemon_status_not_running() {
    let env = CliEnvironment::new();

    let output = env.run(&["daemon", "status"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Not running"));

    let output = env.run(&["daemon", "status", "--json"]);
    let value = json(&output);
    assert_eq!(value["running"], serde_json::json!(false));
    assert_eq!(value["intervalMinutes"], serde_json::json!(30));
}

#[test]
fn test_daemon_stop_without_daemon() {
    let env = CliEnvironment::new();
    let output = env.run(&["daemon", "stop"]);

    assert!(output.status.success());
    assert!(stdout(&output).contains("No daemon appears to be running"));
}
