//! End-to-end builds on the local engine: caching, dependency failure
//! propagation, and target selection through the real binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn hone() -> Command {
    Command::cargo_bin("hone").unwrap()
}

#[test]
fn build_misses_then_hits_cache() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [
                { name: "hello", shell: "echo hi > out.txt", outputs: ["out.txt"] },
            ],
        }"#,
    )
    .unwrap();

    hone()
        .current_dir(dir.path())
        .arg("hello")
        .assert()
        .success()
        .stderr(predicate::str::contains("from cache").not());

    assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hi\n");

    // The manifest and one artifact landed in the local cache.
    assert_eq!(fs::read_dir(dir.path().join(".hone_cache/in")).unwrap().count(), 1);
    assert_eq!(fs::read_dir(dir.path().join(".hone_cache/out")).unwrap().count(), 1);

    hone()
        .current_dir(dir.path())
        .arg("hello")
        .assert()
        .success()
        .stderr(predicate::str::contains("from cache"));
}

#[test]
fn editing_an_input_invalidates_the_cache() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("src.txt"), "one").unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [
                { name: "copy", shell: "cp src.txt out.txt",
                  inputs: ["src.txt"], outputs: ["out.txt"] },
            ],
        }"#,
    )
    .unwrap();

    hone().current_dir(dir.path()).arg("copy").assert().success();
    hone()
        .current_dir(dir.path())
        .arg("copy")
        .assert()
        .success()
        .stderr(predicate::str::contains("from cache"));

    fs::write(dir.path().join("src.txt"), "two").unwrap();
    hone()
        .current_dir(dir.path())
        .arg("copy")
        .assert()
        .success()
        .stderr(predicate::str::contains("from cache").not());
    assert_eq!(fs::read_to_string(dir.path().join("out.txt")).unwrap(), "two");
}

#[test]
fn diamond_failure_propagates_and_counts() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [
                { name: "a", shell: "false" },
                { name: "b", shell: "true", deps: ["a"] },
                { name: "c", shell: "true", deps: ["a"] },
                { name: "d", shell: "true", deps: ["b", "c"] },
            ],
        }"#,
    )
    .unwrap();

    hone()
        .current_dir(dir.path())
        .arg("d")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Failed dependencies"));
}

#[test]
fn target_selection_skips_unrelated_jobs() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [
                { name: "a", shell: "touch a.txt" },
                { name: "b", shell: "touch b.txt", deps: ["a"] },
                { name: "c", shell: "touch c.txt" },
            ],
        }"#,
    )
    .unwrap();

    hone().current_dir(dir.path()).arg("b").assert().success();

    assert!(dir.path().join("a.txt").exists());
    assert!(dir.path().join("b.txt").exists());
    assert!(!dir.path().join("c.txt").exists());
}

#[test]
fn all_target_convention() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            engine: "local",
            jobs: [
                { name: "compile", shell: "touch lib.o" },
                { name: "all", shell: "true", deps: ["compile"] },
            ],
        }"#,
    )
    .unwrap();

    // No arguments: Honefile + target "all".
    hone().current_dir(dir.path()).assert().success();
    assert!(dir.path().join("lib.o").exists());
}

#[test]
fn condition_skips_job_without_failing() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("Honefile"),
        r#"{
            env: ["HONE_RELEASE_FLAG="],
            engine: "local",
            jobs: [
                { name: "gated", shell: "false", condition: "HONE_RELEASE_FLAG = 'yes'" },
            ],
        }"#,
    )
    .unwrap();

    hone()
        .current_dir(dir.path())
        .arg("gated")
        .env_remove("HONE_RELEASE_FLAG")
        .assert()
        .success()
        .stderr(predicate::str::contains("condition not met"));
}
