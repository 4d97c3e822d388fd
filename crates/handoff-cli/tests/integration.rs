use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn handoff(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("handoff").unwrap();
    cmd.current_dir(dir.path())
        .env("HANDOFF_ROOT", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

/// A server URL on a port nothing listens on.
fn dead_server() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

// ---------------------------------------------------------------------------
// handoff init / config
// ---------------------------------------------------------------------------

#[test]
fn init_writes_default_config() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("config.yaml"));

    assert!(dir.path().join(".handoff/config.yaml").exists());
    assert!(dir.path().join(".handoff/sessions").is_dir());

    let raw = std::fs::read_to_string(dir.path().join(".handoff/config.yaml")).unwrap();
    let yaml: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
    assert!(yaml["timing"]["ack_timeout_secs"].is_number());
}

#[test]
fn init_keeps_existing_config() {
    let dir = TempDir::new().unwrap();
    handoff(&dir).arg("init").assert().success();
    let path = dir.path().join(".handoff/config.yaml");
    let edited = std::fs::read_to_string(&path)
        .unwrap()
        .replace("3142", "4000");
    std::fs::write(&path, &edited).unwrap();

    handoff(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Already initialized"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), edited);
}

#[test]
fn config_validate_accepts_defaults() {
    let dir = TempDir::new().unwrap();
    handoff(&dir).arg("init").assert().success();
    handoff(&dir)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Config is valid"));
}

#[test]
fn config_validate_rejects_inverted_timeouts() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join(".handoff")).unwrap();
    std::fs::write(
        dir.path().join(".handoff/config.yaml"),
        "timing:\n  ack_timeout_secs: 600\n  completion_timeout_secs: 60\n",
    )
    .unwrap();
    handoff(&dir)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("[error]"))
        .stderr(predicate::str::contains("config validation found errors"));
}

#[test]
fn config_show_json_has_defaults_without_a_file() {
    let dir = TempDir::new().unwrap();
    let out = handoff(&dir)
        .args(["config", "show", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["server"]["port"], 3142);
}

// ---------------------------------------------------------------------------
// handoff session-id
// ---------------------------------------------------------------------------

#[test]
fn session_id_is_stable_across_cosmetic_differences() {
    let dir = TempDir::new().unwrap();
    let a = handoff(&dir)
        .args(["session-id", "Alice@Example.com", "+15550100"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let b = handoff(&dir)
        .args(["session-id", " alice@example.com ", "+15550100"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(a, b);
    assert!(String::from_utf8(a).unwrap().starts_with("s-"));
}

// ---------------------------------------------------------------------------
// handoff status
// ---------------------------------------------------------------------------

#[test]
fn status_without_sessions() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No sessions."));
}

#[test]
fn status_of_unknown_session_fails() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .args(["status", "--session", "s-0000000000000000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("session not found"));
}

#[test]
fn status_reads_the_record_on_disk() {
    let dir = TempDir::new().unwrap();
    let session = dir.path().join(".handoff/sessions/s-00000000000000aa");
    std::fs::create_dir_all(&session).unwrap();
    std::fs::write(
        session.join("status.json"),
        r#"{
  "sessionId": "s-00000000000000aa",
  "taskId": "20260101T000000-000-0001-abcdef",
  "taskStatus": "working",
  "progress": 40,
  "message": "progress: 40",
  "startedAt": "2026-01-01T00:00:00Z",
  "updatedAt": "2026-01-01T00:01:00Z"
}"#,
    )
    .unwrap();

    handoff(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("s-00000000000000aa"))
        .stdout(predicate::str::contains("working"))
        .stdout(predicate::str::contains("40%"));
}

// ---------------------------------------------------------------------------
// handoff emit / submit against an absent server
// ---------------------------------------------------------------------------

#[test]
fn emit_without_server_explains_the_failure() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .args([
            "emit",
            "--session",
            "s-00000000000000aa",
            "--type",
            "progress",
            "--data",
            "50",
            "--server",
            &dead_server(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("could not reach the handoff server"));
}

#[test]
fn emit_rejects_invalid_session_id() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .args(["emit", "--session", "../etc", "--type", "ack"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a valid session id"));
}

#[test]
fn submit_requires_task_text() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .args(["submit", "-i", "alice@example.com", "--server", &dead_server()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("provide the task text"));
}

// ---------------------------------------------------------------------------
// handoff exec
// ---------------------------------------------------------------------------

#[test]
fn exec_reports_the_exit_status() {
    let dir = TempDir::new().unwrap();
    handoff(&dir)
        .args(["exec", "--", "sh", "-c", "echo deployed; exit 4"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("deployed"))
        .stderr(predicate::str::contains("exited with status 4"));
}

#[test]
fn exec_json_outcome() {
    let dir = TempDir::new().unwrap();
    let out = handoff(&dir)
        .args(["exec", "--json", "--", "echo", "hi"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["stdout"], "hi\n");
}
