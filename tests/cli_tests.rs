//! Integration tests for the dagfile CLI
//!
//! These tests run the actual binary and verify output.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn dagfile_cmd() -> Command {
    Command::cargo_bin("dagfile").unwrap()
}

#[test]
fn test_help_flag() {
    dagfile_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Compile and validate declarative YAML workflow DAGs",
        ));
}

#[test]
fn test_validate_valid_workflow() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flow.yaml");
    fs::write(
        &path,
        r#"
name: nightly
steps:
  - echo extract
  - echo load
"#,
    )
    .unwrap();

    dagfile_cmd()
        .args(["validate", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("valid:"))
        .stdout(predicate::str::contains("nightly"))
        .stdout(predicate::str::contains("2 steps"));
}

#[test]
fn test_validate_invalid_workflow() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    fs::write(
        &path,
        r#"
name: broken
schedule: "1"
steps:
  - echo hi
"#,
    )
    .unwrap();

    dagfile_cmd()
        .args(["validate", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid schedule: 1"));
}

#[test]
fn test_validate_reports_warnings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.yaml");
    fs::write(
        &path,
        r#"
name: legacy
handlerOn:
  cancel:
    command: cleanup.sh
steps:
  - echo hi
"#,
    )
    .unwrap();

    dagfile_cmd()
        .args(["validate", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("warning:"))
        .stdout(predicate::str::contains("deprecated"));
}

#[test]
fn test_validate_missing_file() {
    dagfile_cmd()
        .args(["validate", "/no/such/file.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read"));
}

#[test]
fn test_dump_outputs_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flow.yaml");
    fs::write(&path, "name: dumpme\nsteps:\n  - echo hi\n").unwrap();

    dagfile_cmd()
        .args(["dump", path.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"dumpme\""))
        .stdout(predicate::str::contains("\"type\": \"chain\""));
}

#[test]
fn test_validate_with_params_override() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flow.yaml");
    fs::write(
        &path,
        "name: p\nparams: \"TARGET=dev\"\nsteps:\n  - echo hi\n",
    )
    .unwrap();

    dagfile_cmd()
        .args(["validate", path.to_str().unwrap(), "--params", "TARGET=prod"])
        .assert()
        .success();
}

#[test]
fn test_validate_with_base_config() {
    let dir = TempDir::new().unwrap();
    let base = dir.path().join("base.yaml");
    fs::write(&base, "logDir: /tmp/logs\n").unwrap();
    let path = dir.path().join("flow.yaml");
    fs::write(&path, "name: inh\nsteps:\n  - echo hi\n").unwrap();

    dagfile_cmd()
        .args([
            "validate",
            path.to_str().unwrap(),
            "--base",
            base.to_str().unwrap(),
        ])
        .assert()
        .success();
}
