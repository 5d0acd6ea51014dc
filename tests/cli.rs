use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use assert_cmd::Command;
use chrono::{Duration, Utc};
use predicates::prelude::*;
use tempfile::TempDir;

const TOWN_TOML: &str = r#"
[town]
name = "testtown"

[rigs.gastown]
path = "gastown"
"#;

fn town() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("town.toml"), TOWN_TOML).unwrap();
    std::fs::create_dir_all(dir.path().join("gastown")).unwrap();
    dir
}

fn sling(town: &Path) -> Command {
    let mut cmd = Command::cargo_bin("sling").unwrap();
    cmd.env_remove("SLING_TOWN_ROOT")
        .env_remove("SLING_LOG")
        .arg("--town-root")
        .arg(town);
    cmd
}

fn rate_limit_file(town: &Path) -> PathBuf {
    town.join("gastown/.runtime/rate-limit.json")
}

fn write_rate_limit(town: &Path, backoff_until: chrono::DateTime<Utc>) {
    let path = rate_limit_file(town);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let state = serde_json::json!({
        "limited": true,
        "detected_at": Utc::now() - Duration::minutes(2),
        "last_attempt": Utc::now() - Duration::minutes(1),
        "consecutive_hits": 2,
        "backoff_until": backoff_until,
        "account": "acctA",
        "source": "spawn",
    });
    std::fs::write(path, serde_json::to_vec_pretty(&state).unwrap()).unwrap();
}

fn write_lock(worker_dir: &Path, pid: u32) {
    let runtime = worker_dir.join(".runtime");
    std::fs::create_dir_all(&runtime).unwrap();
    let info = serde_json::json!({
        "pid": pid,
        "acquired_at": Utc::now(),
        "session_id": "gt-gastown-nux",
    });
    std::fs::write(runtime.join("agent.lock"), info.to_string()).unwrap();
}

fn dead_pid() -> u32 {
    let mut child = StdCommand::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

#[test]
fn schema_describes_town_config() {
    let town = town();
    sling(town.path())
        .arg("schema")
        .assert()
        .success()
        .stdout(predicate::str::contains("TownConfig"))
        .stdout(predicate::str::contains("rigs"));
}

#[test]
fn missing_town_is_config_error() {
    let empty = tempfile::tempdir().unwrap();
    sling(empty.path())
        .args(["rate-limit", "status"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("town.toml"));
}

#[test]
fn rate_limit_status_when_clear() {
    let town = town();
    sling(town.path())
        .arg("rate-limit")
        .assert()
        .success()
        .stdout(predicate::str::contains("not rate limited"));
}

#[test]
fn rate_limit_status_reports_active_backoff() {
    let town = town();
    write_rate_limit(town.path(), Utc::now() + Duration::minutes(5));

    sling(town.path())
        .args(["rate-limit", "status", "--rig", "gastown"])
        .assert()
        .success()
        .stdout(predicate::str::contains("RATE LIMITED"))
        .stdout(predicate::str::contains("acctA"))
        .stdout(predicate::str::contains("Hits:      2"))
        .stdout(predicate::str::contains("remaining"));

    let out = sling(town.path())
        .args(["rate-limit", "status", "--json"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let report: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(report["limited"], true);
    assert_eq!(report["consecutive_hits"], 2);
    assert!(report["wait_secs"].as_u64().unwrap() > 0);
}

#[test]
fn rate_limit_clear_resets_state() {
    let town = town();
    write_rate_limit(town.path(), Utc::now() + Duration::minutes(5));

    sling(town.path())
        .args(["rate-limit", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared rate limit for gastown"));

    let state: serde_json::Value =
        serde_json::from_slice(&std::fs::read(rate_limit_file(town.path())).unwrap()).unwrap();
    assert_eq!(state["limited"], false);
    assert_eq!(state["consecutive_hits"], 0);

    sling(town.path())
        .args(["rate-limit", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No rate limit was active"));
}

#[test]
fn dispatch_during_backoff_is_temp_failure() {
    let town = town();
    write_rate_limit(town.path(), Utc::now() + Duration::minutes(5));

    sling(town.path())
        .args(["dispatch", "gastown", "--bead", "gt-1"])
        .assert()
        .code(75)
        .stderr(predicate::str::contains("retry in"));

    assert!(!town.path().join("gastown/polecats").exists());
}

#[test]
fn dispatch_to_unknown_rig_fails_validation() {
    let town = town();
    sling(town.path())
        .args(["dispatch", "nowhere"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("rig 'nowhere' not found"));
}

#[test]
fn lock_status_of_free_worker() {
    let town = town();
    let worker = town.path().join("gastown/polecats/nux");
    sling(town.path())
        .args(["lock", "status"])
        .arg(&worker)
        .assert()
        .success()
        .stdout(predicate::str::contains("unlocked"));
}

#[test]
fn lock_list_and_clean_stale_locks() {
    let town = town();
    let stale = town.path().join("gastown/polecats/nux");
    let live = town.path().join("gastown/polecats/slit");
    write_lock(&stale, dead_pid());
    write_lock(&live, std::process::id());

    sling(town.path())
        .args(["lock", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stale (dead PID"))
        .stdout(predicate::str::contains(format!("locked by PID {}", std::process::id())));

    sling(town.path())
        .args(["lock", "clean"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 stale lock(s)"));

    assert!(!stale.join(".runtime/agent.lock").exists());
    assert!(live.join(".runtime/agent.lock").exists());
}

#[test]
fn lock_release_removes_live_lock() {
    let town = town();
    let worker = town.path().join("gastown/polecats/nux");
    write_lock(&worker, std::process::id());

    sling(town.path())
        .args(["lock", "release"])
        .arg(&worker)
        .assert()
        .success()
        .stdout(predicate::str::contains("Released lock"));
    assert!(!worker.join(".runtime/agent.lock").exists());

    sling(town.path())
        .args(["lock", "release"])
        .arg(&worker)
        .assert()
        .success()
        .stdout(predicate::str::contains("is not locked"));
}

#[test]
fn worker_remove_rejects_malformed_target() {
    let town = town();
    sling(town.path())
        .args(["worker", "remove", "nux"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("expected <rig>/<name>"));
}

#[test]
fn worker_remove_refuses_to_leave_the_workers_dir() {
    let town = town();
    let rig = town.path().join("gastown");
    std::fs::write(rig.join("README.md"), "rig files\n").unwrap();

    for target in ["gastown/..", "gastown/."] {
        sling(town.path())
            .args(["worker", "remove", "--force", target])
            .assert()
            .code(2)
            .stderr(predicate::str::contains("expected <rig>/<name>"));
    }

    assert!(rig.join("README.md").exists());
}

#[test]
fn unsling_requires_bead_id() {
    let town = town();
    sling(town.path())
        .args(["unsling", ""])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("bead id is required"));
}
