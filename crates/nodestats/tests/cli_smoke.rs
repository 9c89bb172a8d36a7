//! CLI smoke tests
//!
//! Runs the built `nodestats` binary against temp settings files and checks
//! the JSON it prints.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

#[allow(deprecated)]
fn nodestats() -> Command {
    let mut cmd = Command::cargo_bin("nodestats").expect("nodestats binary should be built");
    cmd.env_remove("NODESTATS_CONFIG");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn stdout_json(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().expect("command runs");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("stdout is JSON")
}

#[test]
fn settings_prints_defaults() {
    let json = stdout_json(nodestats().arg("settings"));
    assert_eq!(json["settings"]["enabled"], false);
    assert_eq!(json["settings"]["jobs_log_size"], 10_000);
    assert_eq!(json["settings"]["sweep_interval"], "1s");
    assert_eq!(json["rejected"].as_array().map(Vec::len), Some(0));
}

#[test]
fn settings_applies_file_then_overrides() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[stats]\nenabled = true\njobs_log_size = 5\n").unwrap();

    let json = stdout_json(
        nodestats()
            .arg("settings")
            .arg("--config")
            .arg(file.path())
            .args(["--set", "stats.jobs_log_size=7"]),
    );
    assert_eq!(json["settings"]["enabled"], true);
    assert_eq!(json["settings"]["jobs_log_size"], 7);
}

#[test]
fn invalid_override_is_reported_and_ignored() {
    nodestats()
        .args(["settings", "--set", "stats.jobs_log_size=-3"])
        .assert()
        .success()
        .stderr(predicate::str::contains("stats.jobs_log_size"))
        .stderr(predicate::str::contains("previous value is still in effect"))
        .stdout(predicate::str::contains("\"jobs_log_size\": 10000"));
}

#[test]
fn breakers_resolve_against_available_memory() {
    let json = stdout_json(nodestats().args(["breakers", "--available-memory", "1000b"]));
    let breakers = json.as_array().expect("array of breakers");
    let query = breakers
        .iter()
        .find(|b| b["name"] == "query")
        .expect("query breaker");
    assert_eq!(query["limit"], 600);
    assert_eq!(query["limit_human"], "600 B");
    assert!(breakers.iter().any(|b| b["name"] == "logs"));
}

#[test]
fn simulate_reports_stream_sizes() {
    let json = stdout_json(nodestats().args([
        "simulate",
        "--producers",
        "2",
        "--jobs",
        "50",
        "--set",
        "stats.enabled=true",
        "--set",
        "stats.jobs_log_size=10",
        "--flip-size",
        "20",
    ]));
    assert_eq!(json["jobs_started"], 100);
    assert_eq!(json["active_jobs"], 0);
    let jobs = &json["streams"][0];
    assert_eq!(jobs["name"], "jobs");
    assert!(jobs["len"].as_u64().unwrap() <= 20);
}

#[test]
fn missing_config_file_fails() {
    nodestats()
        .args(["settings", "--config", "/nonexistent/nodestats.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"))
        .stderr(predicate::str::contains("To fix:"))
        .stderr(predicate::str::contains("ls -l \"/nonexistent/nodestats.toml\""));
}

#[test]
fn malformed_override_explains_the_fix() {
    nodestats()
        .args(["settings", "--set", "stats.enabled"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value"))
        .stderr(predicate::str::contains("Fix the TOML syntax"));
}
