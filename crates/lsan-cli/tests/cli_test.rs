//! Integration tests for the `lsan` binary.

use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Output};

use tempfile::TempDir;

/// Helper to run lsan with a clean option environment
fn lsan(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_lsan"))
        .args(args)
        .env_remove("LSAN_OPTIONS")
        .env_remove("LSAN_SYMBOLIZER_PATH")
        .env_remove("LD_PRELOAD")
        .output()
        .expect("Failed to execute lsan")
}

/// A file that exists but is not a loadable object. The dynamic loader
/// warns and carries on, which is all `run` needs for these tests.
fn fake_runtime(dir: &TempDir) -> String {
    let path = dir.path().join("liblsan_runtime.so");
    std::fs::write(&path, b"").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
    path.to_str().unwrap().to_string()
}

// ========== flags ==========

#[test]
fn test_flags_prints_tool_defaults_as_toml() {
    let output = lsan(&["flags"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);

    let parsed: toml::Value = toml::from_str(&stdout).expect("flags should print valid TOML");
    assert_eq!(parsed["common"]["exitcode"].as_integer(), Some(23));
    assert_eq!(parsed["common"]["malloc_context_size"].as_integer(), Some(30));
    assert_eq!(parsed["common"]["detect_leaks"].as_bool(), Some(true));
    assert!(parsed.get("lsan").is_some());
}

#[test]
fn test_flags_environment_beats_default_options() {
    let output = lsan(&[
        "flags",
        "--default-options",
        "verbosity=2:max_leaks=7",
        "--options",
        "verbosity=1",
        "--json",
    ]);
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["common"]["verbosity"], 1);
    assert_eq!(json["lsan"]["max_leaks"], 7);
}

#[test]
fn test_flags_reads_lsan_options_from_environment() {
    let output = Command::new(env!("CARGO_BIN_EXE_lsan"))
        .args(["flags", "--json"])
        .env("LSAN_OPTIONS", "exitcode=5:log_path=stdout")
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["common"]["exitcode"], 5);
    assert_eq!(json["common"]["log_path"], "stdout");
}

#[test]
fn test_flags_warns_on_unknown_keys() {
    let output = lsan(&["flags", "--options", "not_a_flag=1"]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not_a_flag"), "stderr: {stderr}");
}

#[test]
fn test_flags_writes_output_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("snapshots/flags.toml");
    let output = lsan(&[
        "flags",
        "--options",
        "coverage=1",
        "--output",
        path.to_str().unwrap(),
    ]);
    assert!(output.status.success());
    let contents = std::fs::read_to_string(&path).unwrap();
    let parsed: toml::Value = toml::from_str(&contents).unwrap();
    assert_eq!(parsed["common"]["coverage"].as_bool(), Some(true));
}

// ========== check ==========

#[test]
fn test_check_accepts_valid_options() {
    let output = lsan(&["check", "verbosity=1:exitcode=0"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("OK: 2 flag(s) differ from defaults"), "{stdout}");
    assert!(stdout.contains("    verbosity"));
    assert!(stdout.contains("    exitcode"));
}

#[test]
fn test_check_rejects_unknown_keys() {
    let output = lsan(&["check", "detect_leaks=1:bogus_flag=2"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unrecognized flag"), "{stderr}");
    assert!(stderr.contains("bogus_flag"), "{stderr}");
}

#[test]
fn test_check_rejects_malformed_token() {
    let output = lsan(&["check", "detect_leaks"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("expected '='"), "{stderr}");
}

// ========== run ==========

#[test]
fn test_run_requires_existing_library() {
    let output = lsan(&["run", "--lib", "/nonexistent/liblsan_runtime.so", "--", "true"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Runtime library not found"), "{stderr}");
}

#[test]
fn test_run_propagates_exit_code() {
    let temp = TempDir::new().unwrap();
    let lib = fake_runtime(&temp);
    let output = lsan(&["run", "--lib", &lib, "--", "sh", "-c", "exit 3"]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn test_run_reports_leak_exit_code() {
    let temp = TempDir::new().unwrap();
    let lib = fake_runtime(&temp);
    let output = lsan(&["run", "--lib", &lib, "--", "sh", "-c", "exit 23"]);
    assert_eq!(output.status.code(), Some(23));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("leaks detected (exit code 23)"), "{stderr}");
}

#[test]
fn test_run_reports_terminating_signal() {
    let temp = TempDir::new().unwrap();
    let lib = fake_runtime(&temp);
    let output = lsan(&["run", "--lib", &lib, "--", "sh", "-c", "kill -SEGV $$"]);
    assert_eq!(output.status.code(), Some(128 + libc::SIGSEGV));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("terminated by SIGSEGV"), "{stderr}");
}

#[test]
fn test_run_sets_child_environment() {
    let temp = TempDir::new().unwrap();
    let lib = fake_runtime(&temp);
    let output = lsan(&[
        "run",
        "--lib",
        &lib,
        "--options",
        "verbosity=1",
        "--",
        "sh",
        "-c",
        "echo \"$LSAN_OPTIONS|$LD_PRELOAD\"",
    ]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let (options, preload) = stdout.trim().split_once('|').unwrap();
    assert_eq!(options, "verbosity=1");
    assert!(preload.ends_with("liblsan_runtime.so"), "{preload}");
}
