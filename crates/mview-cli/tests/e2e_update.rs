//! E2E CLI workflow tests: init -> record -> update -> status, plus the
//! operator commands and their JSON contracts.
//!
//! Each test runs `mview` as a subprocess against an isolated temp data
//! directory.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

/// Build a Command targeting the mview binary with its data dir in `dir`.
fn mview_cmd(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("mview"));
    cmd.current_dir(dir);
    cmd.arg("--data-dir").arg(dir.join("data"));
    // Suppress tracing output that goes to stderr
    cmd.env("MVIEW_LOG", "error");
    cmd.env_remove("MVIEW_MEMORY_LIMIT");
    cmd
}

fn json_output(dir: &Path, args: &[&str]) -> Value {
    let output = mview_cmd(dir)
        .arg("--json")
        .args(args)
        .output()
        .expect("mview should not crash");
    assert!(
        output.status.success(),
        "mview {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("valid JSON on stdout")
}

fn init_view(dir: &Path, view: &str) {
    mview_cmd(dir).args(["init", view]).assert().success();
}

fn record(dir: &Path, view: &str, ids: &[&str]) {
    mview_cmd(dir)
        .args(["record", view])
        .args(ids)
        .assert()
        .success();
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn dry_update_prints_one_chunk_per_line() {
    let tmp = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(tmp.path().join("data")).expect("mkdir");
    std::fs::write(
        tmp.path().join("data/config.toml"),
        "[update]\ndefault_chunk_size = 2\n",
    )
    .expect("write config");

    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["10", "20", "10", "30", "40"]);

    mview_cmd(tmp.path())
        .args(["update", "catalog"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("10 20\n30 40\n"))
        .stdout(predicate::str::contains("applied 4 id(s) in 2 chunk(s)"));

    let status = json_output(tmp.path(), &["status", "catalog"]);
    assert_eq!(status[0]["status"], "idle");
    assert_eq!(status[0]["last_processed_version"], 5);
    assert_eq!(status[0]["lag"], 0);
}

#[test]
fn json_update_reports_outcome_and_chunks() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["1", "2", "3"]);

    let report = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(report["outcome"]["kind"], "completed");
    assert_eq!(report["outcome"]["final_status"], "idle");
    assert_eq!(report["to_version"], 3);
    assert_eq!(report["ids_applied"], 3);
    assert_eq!(report["chunks"][0], serde_json::json!([1, 2, 3]));

    let again = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(again["outcome"]["kind"], "up_to_date");
    assert_eq!(again["ids_applied"], 0);
}

#[test]
fn exec_action_receives_ids_and_failures_exit_nonzero() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "stock");
    record(tmp.path(), "stock", &["7", "8"]);

    let sink = tmp.path().join("applied.txt");
    let script = format!("echo \"$@\" >> {}", sink.display());
    mview_cmd(tmp.path())
        .args(["update", "stock", "--exec", "sh", "-c", &script, "sh"])
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(&sink).expect("read sink"), "7 8\n");

    record(tmp.path(), "stock", &["9"]);
    mview_cmd(tmp.path())
        .args(["update", "stock", "--exec", "false"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E4002"));

    let status = json_output(tmp.path(), &["status", "stock"]);
    assert_eq!(status[0]["status"], "idle");
    assert_eq!(status[0]["last_processed_version"], 2);
    assert_eq!(status[0]["lag"], 1);
}

#[test]
fn suspended_view_is_skipped_until_resumed() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["1"]);

    let suspended = json_output(tmp.path(), &["suspend", "catalog"]);
    assert_eq!(suspended["status"], "suspended");

    let report = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(report["outcome"]["kind"], "skipped");
    assert_eq!(report["outcome"]["status"], "suspended");

    mview_cmd(tmp.path())
        .args(["reset", "catalog"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2002"));

    json_output(tmp.path(), &["resume", "catalog"]);
    let report = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(report["outcome"]["kind"], "completed");
}

#[test]
fn reset_rewinds_checkpoint_for_full_rebuild() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["1", "2"]);
    json_output(tmp.path(), &["update", "catalog"]);

    let reset = json_output(tmp.path(), &["reset", "catalog"]);
    assert_eq!(reset["last_processed_version"], 0);

    let report = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(report["ids_applied"], 2);
}

#[test]
fn restore_is_idempotent() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");

    for _ in 0..2 {
        let restored = json_output(tmp.path(), &["restore", "catalog"]);
        assert_eq!(restored["status"], "idle");
    }
}

#[test]
fn commands_before_init_report_not_initialized() {
    let tmp = TempDir::new().expect("temp dir");
    mview_cmd(tmp.path())
        .args(["status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E1001"))
        .stderr(predicate::str::contains("mview init"));
}

#[test]
fn status_lists_every_view() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    init_view(tmp.path(), "stock");
    record(tmp.path(), "stock", &["5", "6"]);

    let status = json_output(tmp.path(), &["status"]);
    let views: Vec<&str> = status
        .as_array()
        .expect("array")
        .iter()
        .map(|v| v["view"].as_str().expect("view"))
        .collect();
    assert_eq!(views, vec!["catalog", "stock"]);
    assert_eq!(status[1]["lag"], 2);

    mview_cmd(tmp.path())
        .args(["status"])
        .assert()
        .success()
        .stdout(predicate::str::contains("VIEW"))
        .stdout(predicate::str::contains("stock"));
}

#[test]
fn invalid_view_id_is_rejected() {
    let tmp = TempDir::new().expect("temp dir");
    mview_cmd(tmp.path())
        .args(["init", "drop table;"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2001"));
}

#[test]
fn invalid_config_fails_update() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    std::fs::write(
        tmp.path().join("data/config.toml"),
        "[update]\nversion_batch_size = 0\n",
    )
    .expect("write config");

    mview_cmd(tmp.path())
        .args(["update", "catalog"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("version_batch_size"));
}

#[test]
fn update_fails_fast_while_another_process_holds_the_view() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["1"]);

    let data = tmp.path().join("data");
    let held = mview_core::lock::ViewLock::acquire(&data, "catalog", std::time::Duration::ZERO)
        .expect("hold view lock");

    mview_cmd(tmp.path())
        .args(["update", "catalog"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E5002"))
        .stderr(predicate::str::contains(std::process::id().to_string()));

    drop(held);
    let report = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(report["outcome"]["kind"], "completed");
}

#[test]
fn reset_past_head_is_refused() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["1", "2"]);

    mview_cmd(tmp.path())
        .args(["reset", "catalog", "--version", "500"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("E2003"))
        .stderr(predicate::str::contains("head is 2"));

    record(tmp.path(), "catalog", &["3", "4", "5"]);
    let report = json_output(tmp.path(), &["update", "catalog"]);
    assert_eq!(report["outcome"]["kind"], "completed");
    assert_eq!(report["ids_applied"], 5);
}

#[test]
fn full_update_reapplies_the_whole_changelog() {
    let tmp = TempDir::new().expect("temp dir");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["3", "1", "3"]);
    json_output(tmp.path(), &["update", "catalog"]);

    let report = json_output(tmp.path(), &["update", "catalog", "--full"]);
    assert_eq!(report["mode"], "full");
    assert_eq!(report["from_version"], 0);
    assert_eq!(report["ids_applied"], 2);
    assert_eq!(report["checkpoint_version"], 3);

    mview_cmd(tmp.path())
        .args(["update", "catalog", "--full"])
        .assert()
        .success()
        .stdout(predicate::str::contains("reindexed 2 id(s)"));
}

#[test]
fn signal_during_pass_exits_with_interrupted_status() {
    let tmp = TempDir::new().expect("temp dir");
    std::fs::create_dir_all(tmp.path().join("data")).expect("mkdir");
    std::fs::write(
        tmp.path().join("data/config.toml"),
        "[update]\ndefault_chunk_size = 1\n",
    )
    .expect("write config");
    init_view(tmp.path(), "catalog");
    record(tmp.path(), "catalog", &["1", "2", "3"]);

    // The first chunk's program sends SIGTERM to mview itself.
    mview_cmd(tmp.path())
        .args(["update", "catalog", "--exec", "sh", "-c", "kill -TERM $PPID", "sh"])
        .assert()
        .code(75)
        .stdout(predicate::str::contains("interrupted"));

    let status = json_output(tmp.path(), &["status", "catalog"]);
    assert_eq!(status[0]["status"], "idle");
    assert_eq!(status[0]["last_processed_version"], 0);
}
