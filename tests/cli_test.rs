//! CLI integration tests
//!
//! Tests for the command-line interface using assert_cmd.
//!
//! These tests verify:
//! - Help and version flags
//! - Configuration validation
//! - One-shot harvest output
//! - Error handling for missing files

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::io::Write;
use tempfile::{NamedTempFile, TempDir};

/// Get a command for the flex-collector binary
#[allow(deprecated)]
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("flex-collector").expect("Failed to find flex-collector binary");
    cmd.env_remove("RUST_LOG")
        .env_remove("FLEX_CONFIG_FILE")
        .env_remove("FLEX_CONFIG_DIR")
        .env_remove("FLEX_EVENT_LIMIT");
    cmd
}

/// Helper to create a temporary config file with given content
fn create_temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::with_suffix(".yml").expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file.flush().expect("Failed to flush");
    file
}

/// Run one harvest and parse each stdout line as JSON
fn run_once(args: &[&str]) -> Vec<Value> {
    let output = cmd().args(args).output().expect("Failed to run binary");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).expect("stdout line is not JSON"))
        .collect()
}

#[test]
fn test_help_flag() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("--config-file"))
        .stdout(predicate::str::contains("--event-limit"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_validate_valid_config() {
    let file = create_temp_config(
        r#"
name: disk
apis:
  - name: disk
    commands:
      - run: df -k
        split: horizontal
    keep_keys: [Filesystem, Used]
"#,
    );

    cmd()
        .args(["--validate", "--config-file"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration valid: 1 config(s), 1 API(s)"));
}

#[test]
fn test_validate_invalid_regex() {
    let file = create_temp_config(
        r#"
apis:
  - name: broken
    commands:
      - run: echo
    remove_keys: ["(unclosed"]
"#,
    );

    cmd()
        .args(["--validate", "--config-file"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("(unclosed"));
}

#[test]
fn test_invalid_yaml() {
    let file = create_temp_config("apis: [unterminated\n");

    cmd()
        .args(["--validate", "--config-file"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_missing_config_file() {
    cmd()
        .args(["--config-file", "/nonexistent/flex.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
fn test_one_shot_prints_payload() {
    let file = create_temp_config(
        r#"
apis:
  - name: kv
    commands:
      - run: "printf 'name: alpha\nsize: 10\n'"
    custom_attributes:
      env: test
"#,
    );

    let lines = run_once(&["--config-file", &file.path().to_string_lossy()]);
    assert_eq!(lines.len(), 1);
    let sample = &lines[0]["data"][0]["metrics"][0];
    assert_eq!(sample["event_type"], "kvSample");
    assert_eq!(sample["name"], "alpha");
    assert_eq!(sample["size"], 10);
    assert_eq!(sample["env"], "test");
}

#[test]
fn test_event_limit_flag() {
    let file = create_temp_config(
        r#"
apis:
  - name: rows
    commands:
      - run: "printf 'id\n1\n2\n3\n'"
        split: horizontal
"#,
    );

    let lines = run_once(&[
        "--config-file",
        &file.path().to_string_lossy(),
        "--event-limit",
        "2",
    ]);
    let metrics = lines[0]["data"][0]["metrics"].as_array().unwrap();
    assert_eq!(metrics.len(), 2);
    assert_eq!(metrics[1]["id"], 2);
}

#[test]
fn test_config_dir_with_metric_api() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("a.yml"),
        "metric_api: true\napis:\n  - name: a\n    commands:\n      - run: \"echo 'v: 1'\"\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.yaml"),
        "apis:\n  - name: b\n    commands:\n      - run: \"echo 'w: 2'\"\n",
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let lines = run_once(&["--config-dir", &dir.path().to_string_lossy()]);
    assert_eq!(lines.len(), 2);

    let events = lines[0]["data"][0]["metrics"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event_type"], "bSample");

    let batches = lines[1].as_array().unwrap();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0]["metrics"][0]["name"], "v");
    assert_eq!(batches[0]["metrics"][0]["type"], "gauge");
}

#[test]
fn test_pretty_output() {
    let file = create_temp_config("apis:\n  - name: p\n    commands:\n      - run: \"echo 'x: 1'\"\n");

    cmd()
        .args(["--pretty", "--config-file"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("\"protocol_version\": \"3\""));
}
