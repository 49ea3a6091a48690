//! Integration tests for the --validate CLI mode.

use std::path::PathBuf;
use std::process::{Command, Output};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn run_validate(config: &PathBuf, password: Option<&str>) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_logmailer"));
    command.args(["--validate", "-c"]).arg(config);
    match password {
        Some(value) => command.env("LOGMAILER_TEST_SMTP_PASSWORD", value),
        None => command.env_remove("LOGMAILER_TEST_SMTP_PASSWORD"),
    };
    command.output().expect("Failed to run logmailer")
}

#[test]
fn validate_valid_config_exits_success() {
    let output = run_validate(&fixture_path("config_valid.yaml"), Some("s3cret"));

    assert!(
        output.status.success(),
        "logmailer --validate should exit with code 0 for valid config\nstderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Configuration is valid"), "stdout: {}", stdout);
    assert!(stdout.contains("SMTP: smtp.example.com:587"), "stdout: {}", stdout);
    assert!(stdout.contains("Recipients: 3 to, 1 cc, 0 bcc"), "stdout: {}", stdout);
    assert!(stdout.contains("Buffer: 128 events"), "stdout: {}", stdout);
    assert!(stdout.contains("Metrics: enabled (port 9191)"), "stdout: {}", stdout);
}

#[test]
fn validate_minimal_config_exits_success() {
    let output = run_validate(&fixture_path("config_minimal.yaml"), None);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn validate_invalid_config_exits_failure() {
    let output = run_validate(&fixture_path("config_invalid.yaml"), None);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("smtp.host must not be empty"), "stderr: {}", stderr);
    assert!(stderr.contains("buffer_size must be at least 1"), "stderr: {}", stderr);
    assert!(stderr.contains("Configuration validation failed"), "stderr: {}", stderr);
}

#[test]
fn validate_undefined_env_var_exits_failure() {
    let output = run_validate(&fixture_path("config_valid.yaml"), None);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("LOGMAILER_TEST_SMTP_PASSWORD"), "stderr: {}", stderr);
}

#[test]
fn validate_missing_file_exits_failure() {
    let output = run_validate(&PathBuf::from("/nonexistent/logmailer.yaml"), None);

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"), "stderr: {}", stderr);
}
