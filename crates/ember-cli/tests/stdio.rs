//! End-to-end tests for the stdio transport.

#![allow(deprecated)] // Allow deprecated Command::cargo_bin for tests

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};

fn line(channel: &str, msg_type: &str, content: Value) -> String {
    let message = json!({
        "channel": channel,
        "header": {
            "msg_id": format!("{}-1", msg_type),
            "session": "e2e",
            "username": "tester",
            "date": "",
            "msg_type": msg_type,
            "version": "5.3"
        },
        "parent_header": {},
        "metadata": {},
        "content": content
    });
    format!("{}\n", message)
}

fn outputs(stdout: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

fn ember() -> Command {
    Command::cargo_bin("ember").unwrap()
}

#[test]
fn test_shutdown_exits_cleanly() {
    ember()
        .arg("stdio")
        .write_stdin(line("control", "shutdown_request", json!({ "restart": false })))
        .assert()
        .success()
        .stdout(predicate::str::contains("shutdown_reply"));
}

#[test]
fn test_shutdown_exits_while_input_stays_open() {
    use std::io::{Read, Write};
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("ember"))
        .arg("stdio")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let mut input = child.stdin.take().unwrap();
    input
        .write_all(line("control", "shutdown_request", json!({ "restart": false })).as_bytes())
        .unwrap();
    input.flush().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "kernel kept running after shutdown");
        std::thread::sleep(Duration::from_millis(20));
    };
    drop(input);
    assert!(status.success());

    let mut stdout = String::new();
    child.stdout.take().unwrap().read_to_string(&mut stdout).unwrap();
    let messages = outputs(stdout.as_bytes());
    assert!(messages.iter().any(|m| m["header"]["msg_type"] == "shutdown_reply"));
}

#[test]
fn test_execute_until_end_of_input() {
    let output = ember()
        .args(["--embedded", "stdio"])
        .write_stdin(line("shell", "execute_request", json!({ "code": "1 + 1" })))
        .output()
        .unwrap();
    assert!(output.status.success());

    let messages = outputs(&output.stdout);
    let types: Vec<&str> = messages
        .iter()
        .map(|m| m["header"]["msg_type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        vec!["status", "execute_input", "execute_result", "execute_reply", "status"]
    );
    assert_eq!(messages[2]["content"]["data"]["text/plain"], "2");
    assert_eq!(messages[2]["channel"], "iopub");
    assert_eq!(messages[3]["parent_header"]["msg_id"], "execute_request-1");
}

#[test]
fn test_garbage_line_gets_none() {
    ember()
        .args(["--embedded", "stdio"])
        .write_stdin("this is not json\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"msg_type\":\"none\""));
}

#[test]
fn test_config_file_is_applied() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("kernel.json");
    std::fs::write(
        &path,
        r#"{"mode": "embedded", "session": "from-file", "meta_prefix": "%"}"#,
    )
    .unwrap();

    let output = ember()
        .arg("--config")
        .arg(&path)
        .arg("stdio")
        .write_stdin(line("shell", "execute_request", json!({ "code": "%counter" })))
        .output()
        .unwrap();
    assert!(output.status.success());

    let messages = outputs(&output.stdout);
    let result = messages
        .iter()
        .find(|m| m["header"]["msg_type"] == "execute_result")
        .unwrap();
    assert_eq!(result["content"]["data"]["text/plain"], "2");
    let reply = messages
        .iter()
        .find(|m| m["header"]["msg_type"] == "execute_reply")
        .unwrap();
    assert_eq!(reply["metadata"]["engine"], "from-file");
}

#[test]
fn test_missing_config_fails() {
    ember()
        .args(["--config", "/nonexistent/kernel.json", "stdio"])
        .write_stdin("")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot load"));
}
