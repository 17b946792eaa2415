//! CLI Integration Tests
//!
//! These tests run the `pulse` binary against a temporary configuration and
//! database. Commands that need a Bluetooth adapter are marked `#[ignore]`.
//!
//! Run:
//! ```
//! cargo test --package pulse-cli --test cli_integration
//! ```
//!
//! Run hardware tests:
//! ```
//! PULSE_DEVICE="Polar H10" cargo test --package pulse-cli --test cli_integration -- --ignored --nocapture
//! ```

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use pulse_store::Store;
use tempfile::TempDir;

/// A config file pointing at a database inside a temporary directory.
struct Sandbox {
    dir: TempDir,
    config: PathBuf,
}

impl Sandbox {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.toml");
        let database = dir.path().join("heart_rate.db");
        std::fs::write(
            &config,
            format!("database = {:?}\n", database.to_string_lossy()),
        )
        .unwrap();
        Self { dir, config }
    }

    fn database(&self) -> PathBuf {
        self.dir.path().join("heart_rate.db")
    }

    fn run(&self, args: &[&str]) -> Output {
        run_pulse(Some(&self.config), args)
    }
}

/// Run pulse and return output
fn run_pulse(config: Option<&Path>, args: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_pulse"));
    cmd.env_remove("PULSE_DEVICE")
        .env_remove("PULSE_CONFIG")
        .env("NO_COLOR", "true");
    if let Some(config) = config {
        cmd.arg("--config").arg(config);
    }
    cmd.args(args).output().expect("Failed to run pulse binary")
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_command() {
    let output = run_pulse(None, &["--help"]);
    assert!(output.status.success(), "Help should succeed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    for cmd in ["scan", "watch", "history", "clear"] {
        assert!(stdout.contains(cmd), "Help should list {} command", cmd);
    }
}

#[test]
fn test_version_command() {
    let output = run_pulse(None, &["--version"]);
    assert!(output.status.success(), "Version should succeed");
    assert!(String::from_utf8_lossy(&output.stdout).contains("pulse"));
}

#[test]
fn test_subcommand_help() {
    for cmd in ["scan", "watch", "history", "clear"] {
        let output = run_pulse(None, &[cmd, "--help"]);
        assert!(output.status.success(), "{} --help should succeed", cmd);
        assert!(!output.stdout.is_empty(), "{} --help should produce output", cmd);
    }
}

// =============================================================================
// Store-backed commands
// =============================================================================

#[test]
fn test_history_empty_database() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["history"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("No stored readings"));
}

#[test]
fn test_history_formats() {
    let sandbox = Sandbox::new();
    {
        let store = Store::open(sandbox.database()).unwrap();
        store.insert(64, 1_000).unwrap();
        store.insert(66, 2_000).unwrap();
    }

    let output = sandbox.run(&["history", "--format", "csv"]);
    assert!(output.status.success());
    let csv = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "value,timestamp_ms,captured_at");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("64,1000,"));

    let output = sandbox.run(&["history", "--format", "json"]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 2);
    assert_eq!(json[1]["value"], 66);
}

#[test]
fn test_clear_empties_database() {
    let sandbox = Sandbox::new();
    {
        let store = Store::open(sandbox.database()).unwrap();
        store.insert(64, 1_000).unwrap();
    }

    let output = sandbox.run(&["--quiet", "clear"]);
    assert!(output.status.success());
    assert_eq!(Store::open(sandbox.database()).unwrap().count().unwrap(), 0);
}

#[test]
fn test_watch_requires_device() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["watch"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("No device specified"));
}

#[test]
fn test_malformed_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "timeout = \"soon\"").unwrap();

    let output = run_pulse(Some(&config), &["history"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to parse config"));
}

// =============================================================================
// Hardware Tests
// =============================================================================

#[test]
#[ignore = "requires BLE hardware"]
fn test_scan_json_output() {
    let sandbox = Sandbox::new();
    let output = sandbox.run(&["scan", "--timeout", "5", "--format", "json"]);
    assert!(output.status.success(), "Scan JSON should complete");

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(json["count"].is_number());
    assert!(json["devices"].is_array());
}
