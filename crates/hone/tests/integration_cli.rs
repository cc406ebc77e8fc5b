//! CLI-level behavior: argument handling and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn hone() -> Command {
    Command::cargo_bin("hone").unwrap()
}

#[test]
fn missing_config_fails() {
    let dir = TempDir::new().unwrap();
    hone()
        .current_dir(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse configuration file"));
}

#[test]
fn unknown_target_exits_with_one_error() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [{ name: "a", shell: "true" }],
        }"#,
    )
    .unwrap();

    hone()
        .current_dir(dir.path())
        .arg("release")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Target release not found."));
}

#[test]
fn explicit_config_path_argument() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("build.hone"),
        r#"{
            engine: "local",
            jobs: [{ name: "ok", shell: "true" }],
        }"#,
    )
    .unwrap();

    hone()
        .current_dir(dir.path())
        .args(["build.hone", "ok"])
        .assert()
        .success();
}

#[test]
fn invalid_job_declaration_is_fatal() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [{ name: "both", shell: "true", exec: ["true"] }],
        }"#,
    )
    .unwrap();

    hone()
        .current_dir(dir.path())
        .arg("both")
        .assert()
        .failure()
        .stderr(predicate::str::contains("mutually exclusive"));
}
