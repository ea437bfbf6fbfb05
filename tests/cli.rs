//! End-to-end tests of the `mocasm` binary.

use std::io::Write;
use std::process::{Command, Output};

fn mocasm(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_mocasm"))
        .args(args)
        .output()
        .expect("failed to run mocasm")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn test_list_names_every_scenario() {
    let output = mocasm(&["list"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for name in [
        "allocate",
        "allocate-string",
        "record-write",
        "invoke",
        "exit-frame",
        "floor",
        "ceil",
        "truncate",
    ] {
        assert!(text.lines().any(|l| l.starts_with(name)), "missing {} in:\n{}", name, text);
    }
}

#[test]
fn test_emit_prints_listing() {
    let output = mocasm(&["emit", "record-write"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(!stdout(&output).is_empty());
    assert!(stderr(&output).contains("1 write barrier stub calls"));
}

#[test]
fn test_emit_debug_code_is_longer() {
    let plain = mocasm(&["emit", "allocate"]);
    let debug = mocasm(&["emit", "allocate", "--debug-code"]);
    assert!(plain.status.success() && debug.status.success());
    assert!(stdout(&debug).lines().count() > stdout(&plain).lines().count());
}

#[test]
fn test_run_floor_json() {
    let output = mocasm(&["run", "floor", "--arg", "-0.5", "--json"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["scenario"], "floor");
    assert_eq!(report["width"], "w64");
    assert_eq!(report["results"]["result"], "-1.0");
}

#[test]
fn test_run_human_report() {
    let output = mocasm(&["run", "invoke", "--arg", "3", "--arg", "2", "--width", "w32"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("invoke (w32)"));
    assert!(text.contains("adapted"));
    assert!(text.contains("ArgumentsAdaptor"));
}

#[test]
fn test_config_file_sets_width() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "width = \"w32\"").unwrap();
    writeln!(file, "debug_code = true").unwrap();
    let path = file.path().to_str().unwrap();

    let output = mocasm(&["run", "truncate", "--json", "--config", path]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["width"], "w32");

    // Flags win over the file.
    let output = mocasm(&["run", "truncate", "--json", "--config", path, "--width", "w64"]);
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["width"], "w64");
}

#[test]
fn test_bad_config_file_fails() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "width = 12").unwrap();
    let output = mocasm(&["list", "--config", file.path().to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("error"));
}

#[test]
fn test_unknown_scenario_fails() {
    let output = mocasm(&["run", "frobnicate"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("frobnicate"));
}

#[test]
fn test_allocation_exhaustion_reported_as_slow() {
    let output = mocasm(&["run", "allocate", "--arg", "1048576", "--json"]);
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["results"]["path"], "slow");
}
