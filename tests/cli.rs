//! Integration tests for the `broadlink_ac_mqtt` binary.
//!
//! None of these need a broker or a real device.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

const CONFIG_WITHOUT_DEVICES: &str = r#"
service:
  daemon_mode: false
  update_interval: 10
  self_discovery: false
mqtt:
  host: 127.0.0.1
  port: 1883
  topic_prefix: aircon
"#;

/// Command isolated from the caller's environment, running in `dir`.
fn ac_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("broadlink_ac_mqtt");
    cmd.current_dir(dir)
        .env_remove("MQTT_HOST")
        .env_remove("MQTT_PORT")
        .env_remove("MQTT_USERNAME")
        .env_remove("MQTT_PASSWORD")
        .env_remove("MQTT_AUTO_DISCOVERY_TOPIC")
        .env_remove("DEVICES")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_version() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("Monitor Version:"))
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_version_ignores_missing_config() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .args(["-v", "--config", "/nonexistent/config.yml"])
        .assert()
        .success();
}

#[test]
fn test_malformed_devices_argument() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .args(["--devices", r#"{"bad json""#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid JSON in devices argument"));
}

#[test]
fn test_missing_data_dir() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .args(["--data_dir", "/nonexistent/data"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Path Not found for Datadir"));
}

#[test]
fn test_missing_data_dir_dashed() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .args(["--data-dir=/nonexistent/data"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Path Not found for Datadir"));
}

#[test]
fn test_data_dir_selects_config() {
    let dir = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(data.path().join("config.yml"), CONFIG_WITHOUT_DEVICES).unwrap();

    ac_cmd(dir.path())
        .args(["-T", "--data_dir"])
        .arg(data.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("No devices configured to test"));
}

#[test]
fn test_help() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--mqtt-auto-discovery-topic"))
        .stdout(predicate::str::contains("--data-dir"));
}

#[test]
fn test_unknown_option() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .arg("--no-such-option")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Try --help for help"));
}

#[test]
fn test_missing_config_file() {
    let dir = tempfile::tempdir().unwrap();
    ac_cmd(dir.path())
        .args(["--config", "/nonexistent/config.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file not found"));
}

#[test]
fn test_invalid_config_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yml"), "service:\n  daemon_mode: false\n").unwrap();

    ac_cmd(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid config file"));
}

#[test]
fn test_invalid_mqtt_port_env() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yml"), CONFIG_WITHOUT_DEVICES).unwrap();

    ac_cmd(dir.path())
        .env("MQTT_PORT", "not-a-port")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid MQTT port"));
}

#[test]
fn test_mode_without_devices() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yml"), CONFIG_WITHOUT_DEVICES).unwrap();

    ac_cmd(dir.path())
        .arg("-T")
        .assert()
        .success()
        .stdout(predicate::str::contains("No devices configured to test"));
}

#[test]
fn test_mode_with_silent_device() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yml"), CONFIG_WITHOUT_DEVICES).unwrap();

    // Nothing listens on the discard port, so the probe sees no reply
    ac_cmd(dir.path())
        .args([
            "-T",
            "--devices",
            r#"[{"ip":"127.0.0.1","mac":"34ea34aabbcc","name":"Bedroom","port":9}]"#,
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("Bedroom (127.0.0.1:9)"));
}

#[test]
fn test_malformed_dotenv_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.yml"), CONFIG_WITHOUT_DEVICES).unwrap();
    std::fs::write(dir.path().join(".env"), "this line is not an assignment\n").unwrap();

    ac_cmd(dir.path())
        .arg("-T")
        .assert()
        .success()
        .stderr(predicate::str::contains("Ignoring malformed .env file"))
        .stdout(predicate::str::contains("No devices configured to test"));
}
