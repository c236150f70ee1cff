//! End-to-end tests for the `pingwell` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn pingwell(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("pingwell").unwrap();
    cmd.arg("--dir").arg(dir.path()).env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_status_reports_initialized_client() {
    let tmp = TempDir::new().unwrap();

    pingwell(&tmp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized"))
        .stdout(predicate::str::contains("org-example-pingwell"));
}

#[test]
fn test_record_then_send_queues_pending_ping() {
    let tmp = TempDir::new().unwrap();

    pingwell(&tmp)
        .args(["record", "metrics", "loss", "0.5"])
        .assert()
        .success();
    pingwell(&tmp)
        .args(["send", "metrics"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued 1 ping(s)"));
    pingwell(&tmp)
        .arg("pending")
        .assert()
        .success()
        .stdout(predicate::str::contains("metrics"));
}

#[test]
fn test_send_without_data_queues_nothing() {
    let tmp = TempDir::new().unwrap();

    pingwell(&tmp)
        .args(["send", "events"])
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing queued"));
    pingwell(&tmp)
        .arg("pending")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pending pings"));
}

#[test]
fn test_send_fails_when_upload_disabled_in_config() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("config.yaml");
    std::fs::write(&config, "upload_enabled: false\n").unwrap();

    pingwell(&tmp)
        .arg("--config")
        .arg(&config)
        .args(["send", "baseline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not sent"));
}

#[test]
fn test_experiment_set_list_and_clear() {
    let tmp = TempDir::new().unwrap();

    pingwell(&tmp)
        .args(["experiment", "set", "onboarding", "new-flow", "--extra", "cohort=a"])
        .assert()
        .success();
    pingwell(&tmp)
        .args(["experiment", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("onboarding"))
        .stdout(predicate::str::contains("new-flow"))
        .stdout(predicate::str::contains("cohort=a"));

    pingwell(&tmp)
        .args(["experiment", "clear", "onboarding"])
        .assert()
        .success();
    pingwell(&tmp)
        .args(["experiment", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No active experiments"));
}

#[test]
fn test_experiment_extra_requires_key_value() {
    let tmp = TempDir::new().unwrap();

    pingwell(&tmp)
        .args(["experiment", "set", "exp", "branch", "--extra", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("key=value"));
}

#[test]
fn test_record_rejects_ping_names_outside_db_dir() {
    let tmp = TempDir::new().unwrap();

    pingwell(&tmp)
        .args(["record", "../../x", "k", "v"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid ping name"));
    assert!(!tmp.path().join("x.yaml").exists());
}
