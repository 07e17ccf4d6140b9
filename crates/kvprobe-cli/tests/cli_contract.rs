//! Exit codes and output shape of the `kvprobe` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

fn kvprobe(dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("kvprobe").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG").env_remove("KVPROBE_CONFIG");
    cmd
}

#[test]
fn capacity_on_memory_backend_reaches_target() {
    let dir = tempdir().unwrap();
    kvprobe(dir.path())
        .args([
            "capacity",
            "--backend",
            "memory",
            "--unit-bytes",
            "1",
            "--chunk",
            "10",
            "--target",
            "30",
            "--yes",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("[ ok ] capacity"))
        .stdout(predicate::str::contains(
            "Capacity: TargetReached, estimate 30 Bytes after 3 trials",
        ));
}

#[test]
fn json_report_goes_to_stdout() {
    let dir = tempdir().unwrap();
    let output = kvprobe(dir.path())
        .args([
            "count",
            "--backend",
            "memory",
            "--max-records",
            "250",
            "--json",
            "--quiet",
        ])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(0));
    let report: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["probe"], "count");
    assert_eq!(report["outcome"], "limit_found");
    assert_eq!(report["estimate"], 250);
    assert_eq!(report["state"]["phase"], "single");
}

#[test]
fn size_on_sqlite_uses_config_file() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("kvprobe.yaml"),
        "backend:\n  kind: sqlite\n  dir: data\n  max_record_bytes: 20480\nsize:\n  unit_bytes: 1024\n  trial_frequency: 0\n",
    )
    .unwrap();

    kvprobe(dir.path())
        .args(["size", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Single item size: LimitFound"));
    assert!(dir.path().join("data").join("kvprobe.sqlite3").exists());

    kvprobe(dir.path())
        .arg("clear")
        .assert()
        .success()
        .stdout(predicate::str::contains("Deletion of database 'kvprobe' completed."));
    assert!(!dir.path().join("data").join("kvprobe.sqlite3").exists());
}

#[test]
fn invalid_config_exits_with_config_error() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("kvprobe.yaml"), "capacity:\n  chunk_mb: 0\n").unwrap();

    kvprobe(dir.path())
        .arg("estimate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("config error"));
}

#[test]
fn unknown_config_field_is_rejected() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("kvprobe.yaml"), "capacity:\n  chunk: 4\n").unwrap();

    kvprobe(dir.path()).arg("config").assert().code(2);
}

#[test]
fn declined_checkpoint_without_tty_aborts() {
    let dir = tempdir().unwrap();
    kvprobe(dir.path())
        .args([
            "capacity",
            "--backend",
            "memory",
            "--unit-bytes",
            "1",
            "--frequency",
            "1",
        ])
        .write_stdin("")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Capacity: Aborted"));
}

#[test]
fn estimate_prints_usage_and_quota() {
    let dir = tempdir().unwrap();
    kvprobe(dir.path())
        .args(["estimate", "--dir", "store", "--quota-bytes", "1048576"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Current usage: 0 Bytes"))
        .stdout(predicate::str::contains("Quota: 1 MiB"));
}

#[test]
fn config_prints_effective_yaml() {
    let dir = tempdir().unwrap();
    kvprobe(dir.path())
        .args(["config", "--backend", "memory"])
        .assert()
        .success()
        .stdout(predicate::str::contains("kind: memory"))
        .stdout(predicate::str::contains("chunk_mb: 10"));
}
