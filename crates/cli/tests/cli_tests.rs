//! CLI integration tests

use std::process::{Command, Output};

fn schedctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_schedctl"))
        .args(args)
        .env_remove("SCHEDCTL_API_URL")
        .output()
        .expect("Failed to execute command")
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = schedctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("Replica Scheduler"), "Should show app name");
    assert!(stdout.contains("scale-down"), "Should show scale-down command");
    assert!(stdout.contains("scale-up"), "Should show scale-up command");
    assert!(stdout.contains("status"), "Should show status command");
    assert!(stdout.contains("version"), "Should show version command");
}

#[test]
fn test_cli_version_flag() {
    let output = schedctl(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("schedctl"), "Should show binary name");
}

#[test]
fn test_global_options() {
    let output = schedctl(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(stdout.contains("--api-url"), "Should show api-url option");
    assert!(stdout.contains("SCHEDCTL_API_URL"), "Should show env var");
    assert!(stdout.contains("--kubeconfig"), "Should show kubeconfig option");
    assert!(stdout.contains("--format"), "Should show format option");
    assert!(stdout.contains("table"), "Should show table format");
    assert!(stdout.contains("json"), "Should show json format");
}

#[test]
fn test_scale_down_help() {
    let output = schedctl(&["scale-down", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Scale-down help should succeed");
    assert!(stdout.contains("<WORKLOAD>"), "Should show workload argument");
    assert!(stdout.contains("<namespace>/<name>"), "Should describe workload format");
}

#[test]
fn test_scale_up_help() {
    let output = schedctl(&["scale-up", "--help"]);

    assert!(output.status.success(), "Scale-up help should succeed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("<WORKLOAD>"));
}

#[test]
fn test_status_help() {
    let output = schedctl(&["status", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Status help should succeed");
    assert!(stdout.contains("--namespace"), "Should show namespace option");
    assert!(stdout.contains("--all"), "Should show all option");
    assert!(stdout.contains("--utc"), "Should show utc option");
}

#[test]
fn test_invalid_command() {
    let output = schedctl(&["invalid-command"]);

    assert!(!output.status.success(), "Invalid command should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("error") || stderr.contains("invalid"),
        "Should show error message"
    );
}

#[test]
fn test_missing_workload_argument() {
    let output = schedctl(&["scale-down"]);

    assert!(!output.status.success(), "Missing argument should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("required") || stderr.contains("error"),
        "Should show error about missing argument"
    );
}

#[test]
fn test_workload_without_namespace_is_rejected() {
    let output = schedctl(&["--api-url", "http://127.0.0.1:9", "scale-up", "web"]);

    assert!(!output.status.success(), "Bare workload name should fail");
    assert!(String::from_utf8_lossy(&output.stderr).contains("<namespace>/<name>"));
}
