//! Integration tests for the `etx-bridge` binary.
//!
//! Argument parsing, config handling, frame decoding and short dry runs,
//! all without a live MQTT broker.
#![allow(clippy::unwrap_used)]

use std::fmt::Write as _;
use std::net::{TcpListener, UdpSocket};

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// Build a [`Command`] for the `etx-bridge` binary with env isolation.
///
/// Clears the `ETX_BRIDGE_*` vars the tests could inherit and points config
/// directories at a nonexistent path so tests never touch a real config.
fn bridge_cmd() -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("etx-bridge");
    cmd.env("HOME", "/tmp/etx-bridge-cli-test-nonexistent")
        .env("XDG_CONFIG_HOME", "/tmp/etx-bridge-cli-test-nonexistent")
        .env_remove("RUST_LOG")
        .env_remove("ETX_BRIDGE_CONFIG")
        .env_remove("ETX_BRIDGE_BROKER")
        .env_remove("ETX_BRIDGE_AGENT_ID")
        .env_remove("ETX_BRIDGE_MQTT__HOST")
        .env_remove("ETX_BRIDGE_MQTT__PORT")
        .env_remove("ETX_BRIDGE_UDP__PORT")
        .env_remove("ETX_BRIDGE_UDP__LISTEN_ADDR");
    cmd
}

/// Concatenate stdout + stderr from a command output for flexible matching.
fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

/// Hex for a frame from device AABBCCDDEEFF with one pressure sample.
fn frame_hex() -> String {
    let mut bytes = vec![0x5A, 0x5A];
    bytes.extend_from_slice(&0xAABB_CCDD_EEFF_u64.to_le_bytes()[..6]);
    bytes.push(1);
    bytes.extend_from_slice(&1_700_000_000_u32.to_le_bytes());
    bytes.extend_from_slice(&500_u16.to_le_bytes());
    bytes.extend_from_slice(&1234_i32.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 36]);
    bytes.extend_from_slice(&[0xA5, 0xA5]);
    bytes.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn write_config(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_no_args_shows_help() {
    let output = bridge_cmd().output().unwrap();
    assert_eq!(output.status.code(), Some(2), "Expected exit code 2");
    let text = combined_output(&output);
    assert!(text.contains("Usage"), "Expected 'Usage' in output:\n{text}");
}

#[test]
fn test_help_flag() {
    bridge_cmd().arg("--help").assert().success().stdout(
        predicate::str::contains("MQTT")
            .and(predicate::str::contains("run"))
            .and(predicate::str::contains("decode"))
            .and(predicate::str::contains("config")),
    );
}

#[test]
fn test_version_flag() {
    bridge_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("etx-bridge"));
}

// ── Shell completions ───────────────────────────────────────────────

#[test]
fn test_completions_bash() {
    bridge_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty().not());
}

#[test]
fn test_completions_zsh() {
    bridge_cmd()
        .args(["completions", "zsh"])
        .assert()
        .success()
        .stdout(predicate::str::contains("#compdef"));
}

// ── Decode ──────────────────────────────────────────────────────────

#[test]
fn test_decode_prints_parsed_frame() {
    bridge_cmd()
        .args(["decode", "-o", "json-compact", &frame_hex()])
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#""dn":"AABBCCDDEEFF""#)
                .and(predicate::str::contains(r#""sn":1"#))
                .and(predicate::str::contains(r#""p":[1234]"#))
                .and(predicate::str::contains(r#""ts":1700000000.5"#)),
        );
}

#[test]
fn test_decode_metadata_from_truncated_frame() {
    let header = &frame_hex()[..30];
    bridge_cmd()
        .args(["decode", "--metadata", "-o", "json-compact", header])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""dn":"AABBCCDDEEFF""#));
}

#[test]
fn test_decode_rejects_truncated_frame() {
    let hex = frame_hex();
    let output = bridge_cmd()
        .args(["decode", &hex[..hex.len() - 4]])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let text = combined_output(&output);
    assert!(text.contains("Not a sensor frame"), "got:\n{text}");
}

#[test]
fn test_decode_rejects_bad_hex() {
    let output = bridge_cmd().args(["decode", "5a5g"]).output().unwrap();
    assert_eq!(output.status.code(), Some(2));
}

// ── Config ──────────────────────────────────────────────────────────

#[test]
fn test_config_path_honours_flag() {
    bridge_cmd()
        .args(["--config", "/tmp/elsewhere/bridge.toml", "config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("/tmp/elsewhere/bridge.toml"));
}

#[test]
fn test_config_path_default() {
    bridge_cmd()
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("etx-bridge").and(predicate::str::contains("config.toml")));
}

#[test]
fn test_config_init_refuses_to_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let path_arg = path.to_str().unwrap();

    bridge_cmd()
        .args(["--config", path_arg, "config", "init"])
        .assert()
        .success();
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[mqtt]"));
    assert!(written.contains("GCU_SUBSCRIBE"));

    let output = bridge_cmd()
        .args(["--config", path_arg, "config", "init"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("already exists"));

    bridge_cmd()
        .args(["--config", path_arg, "config", "init", "--force"])
        .assert()
        .success();
}

#[test]
fn test_config_show_redacts_and_applies_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        "[mqtt]\nhost = \"file-host\"\nusername = \"bridge\"\npassword = \"hunter2\"\n",
    );

    bridge_cmd()
        .args(["--config", path.to_str().unwrap(), "--broker", "flag-host", "config", "show"])
        .env("ETX_BRIDGE_MQTT__PORT", "2883")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("host = \"flag-host\"")
                .and(predicate::str::contains("port = 2883"))
                .and(predicate::str::contains("********"))
                .and(predicate::str::contains("hunter2").not()),
        );
}

#[test]
fn test_config_show_reports_invalid_token() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[gcu]\nack_token = \"ZACK\"\n");

    let output = bridge_cmd()
        .args(["--config", path.to_str().unwrap(), "config", "show"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("gcu.ack_token"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let output = bridge_cmd()
        .args(["--config", "/tmp/etx-bridge-cli-test-nonexistent/x.toml", "config", "show"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(combined_output(&output).contains("config init"));
}

// ── Run ─────────────────────────────────────────────────────────────

#[test]
fn test_dry_run_stops_cleanly() {
    bridge_cmd()
        .args(["--udp-port", "0", "run", "--dry-run", "--duration", "1"])
        .env("ETX_BRIDGE_UDP__LISTEN_ADDR", "127.0.0.1")
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""state":"idle""#));
}

#[test]
fn test_run_reports_bind_failure() {
    let held = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port().to_string();

    let output = bridge_cmd()
        .args(["--udp-port", &port, "run", "--dry-run", "--duration", "1"])
        .env("ETX_BRIDGE_UDP__LISTEN_ADDR", "127.0.0.1")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(9));
    assert!(combined_output(&output).contains("Could not bind UDP socket"));
}

#[test]
fn test_run_reports_unreachable_broker() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port().to_string()
    };

    let output = bridge_cmd()
        .args(["--broker", "127.0.0.1", "--port", &port, "--udp-port", "0", "run"])
        .env("ETX_BRIDGE_UDP__LISTEN_ADDR", "127.0.0.1")
        .env("ETX_BRIDGE_MQTT__CONNECT_TIMEOUT_SECS", "2")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(7));
    assert!(combined_output(&output).contains("Could not connect to MQTT broker"));
}
