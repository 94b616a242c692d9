//! End-to-end tests for the `lab` binary.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn lab(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("lab").unwrap();
    cmd.current_dir(dir.path()).env("RUST_LOG", "warn");
    cmd
}

const SWEEP: &str = r#"
name: cli_sweep
interval_secs: 0
measurements_per_condition: 2
conditions:
  - variable: bias
    values: [1, 2, 3]
csv:
  path: sweep.csv
parquet:
  path: sweep.parquet
"#;

#[test]
fn test_run_completes_sweep_and_writes_logs() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("exp.yaml"), SWEEP).unwrap();

    lab(&tmp)
        .args(["run", "exp.yaml", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"))
        .stdout(predicate::str::contains("sweep.csv"));

    let csv = fs::read_to_string(tmp.path().join("sweep.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("time,bias,value,channel"));
    assert_eq!(lines.count(), 6);
    assert!(tmp.path().join("sweep.parquet").exists());
}

#[test]
fn test_run_stops_at_max_samples() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("free.yaml"),
        "name: free_running\ncsv:\n  path: free.csv\n",
    )
    .unwrap();

    lab(&tmp)
        .args(["run", "free.yaml", "--max-samples", "5", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("STOPPED"));

    let csv = fs::read_to_string(tmp.path().join("free.csv")).unwrap();
    assert_eq!(csv.lines().count(), 6);
}

#[test]
fn test_run_fails_when_log_exists() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("exp.yaml"), SWEEP).unwrap();
    fs::write(tmp.path().join("sweep.csv"), "taken").unwrap();

    lab(&tmp)
        .args(["run", "exp.yaml", "--quiet"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("logger failed"));
}

#[test]
fn test_inspect_prints_schema_and_tail() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("exp.yaml"), SWEEP).unwrap();
    lab(&tmp).args(["run", "exp.yaml", "-q"]).assert().success();

    lab(&tmp)
        .args(["inspect", "sweep.csv", "--tail", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rows: 6"))
        .stdout(predicate::str::contains("channel"))
        .stdout(predicate::str::contains("text"))
        .stdout(predicate::str::contains("Last 2 rows"));

    lab(&tmp)
        .args(["inspect", "sweep.parquet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Rows: 6"));
}

#[test]
fn test_export_formats() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("exp.yaml"), SWEEP).unwrap();
    lab(&tmp).args(["run", "exp.yaml", "-q"]).assert().success();

    lab(&tmp)
        .args(["export", "sweep.parquet", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"channel\": \"sim\""));

    lab(&tmp)
        .args(["export", "sweep.csv", "--format", "parquet", "--output", "copy.parquet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 6 rows"));

    lab(&tmp)
        .args(["export", "copy.parquet"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("time,bias,value,channel"));

    lab(&tmp)
        .args(["export", "sweep.csv", "--format", "parquet"])
        .assert()
        .failure();
}

#[test]
fn test_init_writes_runnable_config() {
    let tmp = TempDir::new().unwrap();
    lab(&tmp).args(["init", "demo.yaml"]).assert().success();
    lab(&tmp)
        .args(["init", "demo.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    lab(&tmp)
        .args(["run", "demo.yaml", "--interval", "0", "--quiet"])
        .assert()
        .success()
        .stdout(predicate::str::contains("COMPLETED"));
    assert!(tmp.path().join("bias_sweep.csv").exists());
    assert!(tmp.path().join("bias_sweep.svg").exists());
}

#[test]
fn test_inspect_missing_file_fails() {
    let tmp = TempDir::new().unwrap();
    lab(&tmp)
        .args(["inspect", "nope.csv"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
