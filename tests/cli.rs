#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

// Nothing listens on the discard port, so every probe reports offline.
const UNREACHABLE: &str = "http://127.0.0.1:9";

fn cli(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("fieldsync").expect("binary");
    cmd.env_remove("FIELDSYNC_DATA_DIR")
        .env_remove("FIELDSYNC_API_URL")
        .env("FIELDSYNC_LOG", "off")
        .env("FIELDSYNC_REQUEST_TIMEOUT_SECS", "2")
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--api-url")
        .arg(UNREACHABLE);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.output().expect("run");
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("utf8")
}

#[test]
fn queue_add_list_and_dismiss() {
    let dir = tempdir().unwrap();

    let id = stdout_of(cli(dir.path()).args([
        "queue",
        "add",
        "--type",
        "order",
        "--action",
        "update",
        "--target",
        "42",
        "--payload",
        r#"{"status":"completed"}"#,
    ]))
    .trim()
    .to_string();
    assert!(!id.is_empty());

    let listed: Value =
        serde_json::from_str(&stdout_of(cli(dir.path()).args(["queue", "list", "--json"])))
            .unwrap();
    let items = listed.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], id.as_str());
    assert_eq!(items[0]["type"], "order");
    assert_eq!(items[0]["targetId"], "42");
    assert_eq!(items[0]["payload"]["status"], "completed");

    let by_type: Value = serde_json::from_str(&stdout_of(
        cli(dir.path()).args(["queue", "list", "--type", "job", "--json"]),
    ))
    .unwrap();
    assert!(by_type.as_array().unwrap().is_empty());

    let out = stdout_of(cli(dir.path()).args(["queue", "dismiss", &id]));
    assert!(out.contains("Dismissed"));

    cli(dir.path())
        .args(["queue", "dismiss", &id])
        .assert()
        .code(1);
}

#[test]
fn unknown_entity_type_is_a_usage_error() {
    let dir = tempdir().unwrap();
    cli(dir.path())
        .args(["queue", "add", "--type", "invoice", "--action", "create"])
        .assert()
        .failure();
}

#[test]
fn invalid_payload_reports_an_error() {
    let dir = tempdir().unwrap();
    let output = cli(dir.path())
        .args([
            "queue", "add", "--type", "order", "--action", "update", "--target", "1",
            "--payload", "{not json",
        ])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--payload"));
}

#[test]
fn status_reports_counts_as_json() {
    let dir = tempdir().unwrap();
    stdout_of(cli(dir.path()).args([
        "queue", "add", "--type", "job", "--action", "create",
    ]));

    let photo = dir.path().join("meter.jpg");
    std::fs::write(&photo, [0xFF, 0xD8, 0xFF, 0xE0, 0, 0x10]).unwrap();
    stdout_of(
        cli(dir.path())
            .args(["photos", "add", "--job", "17"])
            .arg(&photo),
    );

    let status: Value =
        serde_json::from_str(&stdout_of(cli(dir.path()).args(["status", "--json"]))).unwrap();
    assert_eq!(status["online"], false);
    assert_eq!(status["pendingCount"], 1);
    assert_eq!(status["pendingPhotos"], 1);
    assert_eq!(status["isSyncing"], false);
}

#[test]
fn sync_while_unreachable_is_skipped() {
    let dir = tempdir().unwrap();
    stdout_of(cli(dir.path()).args([
        "queue", "add", "--type", "order", "--action", "update", "--target", "42",
    ]));

    let out = stdout_of(cli(dir.path()).arg("sync"));
    assert!(out.contains("Sync skipped"), "unexpected output: {out}");

    let listed: Value =
        serde_json::from_str(&stdout_of(cli(dir.path()).args(["queue", "list", "--json"])))
            .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}

#[test]
fn auth_login_and_logout() {
    let dir = tempdir().unwrap();
    let out = stdout_of(cli(dir.path()).args(["auth", "login", "--token", "abc123"]));
    assert!(out.contains("Session saved"));

    let saved: Value =
        serde_json::from_slice(&std::fs::read(dir.path().join("session.json")).unwrap()).unwrap();
    assert_eq!(saved["accessToken"], "abc123");

    let out = stdout_of(cli(dir.path()).args(["auth", "logout"]));
    assert!(out.contains("Session removed"));
    let out = stdout_of(cli(dir.path()).args(["auth", "logout"]));
    assert!(out.contains("No session stored"));
}

#[test]
fn cache_clear_keeps_queue() {
    let dir = tempdir().unwrap();
    stdout_of(cli(dir.path()).args([
        "queue", "add", "--type", "seal", "--action", "delete", "--target", "3",
    ]));
    let out = stdout_of(cli(dir.path()).args(["cache", "clear"]));
    assert!(out.contains("Cleared 0 cached entries"));

    let listed: Value =
        serde_json::from_str(&stdout_of(cli(dir.path()).args(["queue", "list", "--json"])))
            .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
}
