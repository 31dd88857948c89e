#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::Command;

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "linkprims-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn linkprims() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_linkprims"));
    cmd.arg("--log-level").arg("error");
    cmd
}

#[test]
fn simulate_json_reports_lifecycle() {
    let output = linkprims()
        .args(["--format", "json", "simulate"])
        .args(["--sessions", "1", "--peer-sessions", "3", "--reject-every", "3"])
        .output()
        .expect("simulate should run");

    assert!(
        output.status.success(),
        "simulate failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(report["sessions_opened"], 1);
    assert_eq!(report["sessions_accepted"], 2);
    assert_eq!(report["sessions_rejected"], 1);
    assert_eq!(report["endpoint_errors"], 0);
    assert_eq!(report["container_id"], "linkprims");
}

#[test]
fn simulate_reads_scenario_file() {
    let dir = unique_temp_dir("scenario");
    let path = dir.join("scenario.json");
    std::fs::write(
        &path,
        r#"{
            "connection": { "container_id": "edge-7" },
            "sessions": 2,
            "senders": 2,
            "receivers": 0,
            "peer_sessions": 0
        }"#,
    )
    .expect("scenario file should be writable");

    let output = linkprims()
        .args(["--format", "json", "simulate", "--scenario"])
        .arg(&path)
        .args(["--receivers", "1"])
        .output()
        .expect("simulate should run");

    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["container_id"], "edge-7");
    assert_eq!(report["senders"], 4);
    assert_eq!(report["receivers"], 2);
    assert_eq!(report["sessions_accepted"], 0);
}

#[test]
fn simulate_table_output() {
    let output = linkprims()
        .args(["--format", "table", "simulate", "--peer-sessions", "0"])
        .output()
        .expect("simulate should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Simulation Report"));
    assert!(stdout.contains("sessions opened"));
}

#[test]
fn malformed_scenario_exits_data_invalid() {
    let dir = unique_temp_dir("bad-scenario");
    let path = dir.join("scenario.json");
    std::fs::write(&path, "{ not json").unwrap();

    let output = linkprims()
        .args(["simulate", "--scenario"])
        .arg(&path)
        .output()
        .expect("simulate should run");

    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("parse scenario"));
}

#[test]
fn bad_timeout_exits_usage() {
    let output = linkprims()
        .args(["simulate", "--timeout", "0ms"])
        .output()
        .expect("simulate should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_prints_package_version() {
    let output = linkprims().arg("version").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("linkprims {}", env!("CARGO_PKG_VERSION"))
    );
}
