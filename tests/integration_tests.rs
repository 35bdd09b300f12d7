//! Integration tests for the chrome-troubleshooter binary
//!
//! Every test points config, session storage and the lock file at a temp
//! directory and uses small shell scripts in place of a browser.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use chrome_troubleshooter::lock::LockManager;
use predicates::prelude::*;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CT_VARS: &[&str] = &[
    "CT_LAUNCH_TIMEOUT",
    "CT_MAX_ATTEMPTS",
    "CT_EXTRA_FLAGS",
    "CT_CHROME_PATH",
    "CHROME_PATH",
    "CT_LOCK_PATH",
    "CT_FLATPAK_FALLBACK",
    "CT_JOURNAL_LINES",
    "CT_BASE_DIR",
    "CT_ENABLE_SQLITE",
    "CT_ENABLE_JSON",
    "CT_COLOR",
    "CT_LOG_LEVEL",
    "RUST_LOG",
];

/// Helper to create an isolated command rooted in `dir`
fn ct(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("chrome-troubleshooter");
    for var in CT_VARS {
        cmd.env_remove(var);
    }
    cmd.env("CT_LOCK_PATH", dir.path().join("ct.lock"))
        .env("CT_COLOR", "0")
        .arg("--config-file")
        .arg(dir.path().join("config.toml"))
        .arg("--base-dir")
        .arg(dir.path().join("sessions"));
    cmd
}

/// Config with no pause between attempts
fn write_fast_config(dir: &TempDir) {
    fs::write(
        dir.path().join("config.toml"),
        "[launch]\ninter_attempt_delay_ms = 0\ngrace_period_secs = 1\n",
    )
    .unwrap();
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_snapshot(dir: &TempDir, json: &str) -> PathBuf {
    let path = dir.path().join("snapshot.json");
    fs::write(&path, json).unwrap();
    path
}

fn session_dirs(dir: &TempDir) -> Vec<PathBuf> {
    let mut dirs: Vec<_> = fs::read_dir(dir.path().join("sessions"))
        .map(|rd| rd.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    dirs.sort();
    dirs
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("launch"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        ct(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        ct(&dir).arg("explode").assert().failure();
    }
}

// =============================================================================
// Stage plan
// =============================================================================

mod stages {
    use super::*;

    #[test]
    fn test_stages_json_from_snapshot() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(
            &dir,
            r#"{"gpu_vendor":"nvidia","vaapi_driver_present":false,"display_protocol":"wayland"}"#,
        );

        let output = ct(&dir)
            .args(["stages", "--json", "--snapshot"])
            .arg(&snapshot)
            .output()
            .unwrap();
        assert!(output.status.success());

        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        let names: Vec<_> = value["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["vanilla", "nvidia_vaapi", "no_gpu", "x11_compat"]);
        assert_eq!(value["skipped"][0]["name"], "safe_mode");
    }

    #[test]
    fn test_stages_text_marks_skipped() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(&dir, "{}");

        ct(&dir)
            .env("CT_MAX_ATTEMPTS", "1")
            .args(["stages", "--snapshot"])
            .arg(&snapshot)
            .assert()
            .success()
            .stdout(predicate::str::contains("vanilla"))
            .stdout(predicate::str::contains("beyond max_attempts"));
    }

    #[test]
    fn test_stages_bad_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(&dir, "not json");

        ct(&dir)
            .args(["stages", "--snapshot"])
            .arg(&snapshot)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse snapshot"));
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("stability_window_secs = 10"));
    }

    #[test]
    fn test_config_init_then_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        ct(&dir).args(["config", "init"]).assert().success();
        assert!(dir.path().join("config.toml").exists());

        ct(&dir)
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--force"));

        ct(&dir).args(["config", "init", "--force"]).assert().success();
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[launch]\nextra_flags = [\"no-dashes\"]\n",
        )
        .unwrap();

        ct(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("does not start with '--'"));
    }

    #[test]
    fn test_config_env_override_shows_in_effective_values() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .env("CT_LAUNCH_TIMEOUT", "42")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stability_window_secs = 42"));
    }
}

// =============================================================================
// Launch
// =============================================================================

mod launch {
    use super::*;

    #[test]
    fn test_launch_missing_executable_exits_2() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(&dir, "{}");

        ct(&dir)
            .args(["launch", "--no-flatpak", "--executable"])
            .arg(dir.path().join("no-such-browser"))
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .code(2);
        assert!(session_dirs(&dir).is_empty());
    }

    #[test]
    fn test_launch_stable_browser_succeeds() {
        let dir = TempDir::new().unwrap();
        write_fast_config(&dir);
        let snapshot = write_snapshot(&dir, "{}");
        let browser = write_script(dir.path(), "browser", "sleep 3");

        ct(&dir)
            .args(["launch", "--no-flatpak", "--no-diagnostics", "--timeout", "1"])
            .arg("--executable")
            .arg(&browser)
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .success()
            .stdout(predicate::str::contains("Browser launched with stage vanilla"));

        let sessions = session_dirs(&dir);
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].join("summary.json").exists());
        assert!(sessions[0].join("logs.jsonl").exists());
        assert!(sessions[0].join("logs.sqlite").exists());
        assert!(sessions[0].join("launcher.log").exists());
    }

    #[test]
    fn test_launch_exhausted_exits_3() {
        let dir = TempDir::new().unwrap();
        write_fast_config(&dir);
        let snapshot = write_snapshot(&dir, "{}");
        let browser = write_script(dir.path(), "browser", "echo 'GPU process crashed' >&2; exit 1");

        ct(&dir)
            .args(["launch", "--no-flatpak", "--no-diagnostics", "--max-attempts", "2"])
            .arg("--executable")
            .arg(&browser)
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .code(3)
            .stdout(predicate::str::contains("All 2 stage(s) failed"));

        let sessions = session_dirs(&dir);
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].join("attempt-1.out").exists());
        assert!(sessions[0].join("attempt-2.out").exists());
        assert!(!sessions[0].join("attempt-3.out").exists());

        let log = fs::read_to_string(sessions[0].join("logs.jsonl")).unwrap();
        assert!(log.contains("GPU process crashed"));
    }

    #[test]
    fn test_launch_flatpak_fallback_lands_in_session_record() {
        let dir = TempDir::new().unwrap();
        write_fast_config(&dir);
        let snapshot = write_snapshot(&dir, "{}");
        let browser = write_script(dir.path(), "browser", "exit 1");
        let bin = dir.path().join("bin");
        fs::create_dir(&bin).unwrap();
        write_script(&bin, "flatpak", "echo \"flatpak $*\" >&2; exit 1");

        ct(&dir)
            .env("PATH", format!("{}:/usr/bin:/bin", bin.display()))
            .args(["launch", "--no-diagnostics", "--max-attempts", "1"])
            .arg("--executable")
            .arg(&browser)
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .code(3);

        let sessions = session_dirs(&dir);
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].join("flatpak.out").exists());

        let log = fs::read_to_string(sessions[0].join("logs.jsonl")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        let tried = lines
            .iter()
            .position(|l| l.contains("Trying Flatpak Chromium fallback"))
            .unwrap();
        let failed = lines
            .iter()
            .position(|l| l.contains("Flatpak fallback failed"))
            .unwrap();
        let ended = lines
            .iter()
            .position(|l| l.contains("Total log entries"))
            .unwrap();
        assert!(tried < failed && failed < ended);
    }

    #[test]
    fn test_launch_while_locked_exits_1() {
        let dir = TempDir::new().unwrap();
        let snapshot = write_snapshot(&dir, "{}");
        let browser = write_script(dir.path(), "browser", "sleep 3");
        let _held = LockManager::new(dir.path().join("ct.lock"))
            .acquire()
            .unwrap();

        ct(&dir)
            .args(["launch", "--no-flatpak", "--no-diagnostics"])
            .arg("--executable")
            .arg(&browser)
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .code(1)
            .stderr(predicate::str::contains("already running"));
        assert!(session_dirs(&dir).is_empty());
    }
}

// =============================================================================
// Logs
// =============================================================================

mod logs {
    use super::*;

    #[test]
    fn test_logs_empty_base_dir() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .args(["logs", "--list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No sessions found"));
    }

    #[test]
    fn test_logs_after_launch() {
        let dir = TempDir::new().unwrap();
        write_fast_config(&dir);
        let snapshot = write_snapshot(&dir, "{}");
        let browser = write_script(dir.path(), "browser", "exit 4");

        ct(&dir)
            .args(["launch", "--no-flatpak", "--no-diagnostics", "--max-attempts", "1"])
            .arg("--executable")
            .arg(&browser)
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .code(3);

        ct(&dir)
            .args(["logs", "--list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("exhausted"));

        ct(&dir)
            .args(["logs", "--latest"])
            .assert()
            .success()
            .stdout(predicate::str::contains("exit code 4"));

        let output = ct(&dir)
            .args(["logs", "--latest", "--format", "json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(value["summary"]["result"], "exhausted");
        assert!(value["entries"].as_array().unwrap().len() > 3);
    }

    #[test]
    fn test_logs_unknown_session_fails() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .args(["logs", "--session", "session_nope"])
            .assert()
            .failure();
    }

    #[test]
    fn test_logs_rejects_unknown_format() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .args(["logs", "--format", "xml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown format"));
    }
}

// =============================================================================
// Diag
// =============================================================================

mod diag {
    use super::*;

    #[test]
    fn test_diag_without_sessions_fails() {
        let dir = TempDir::new().unwrap();
        ct(&dir)
            .arg("diag")
            .assert()
            .failure()
            .stderr(predicate::str::contains("No sessions found"));
    }

    #[test]
    fn test_diag_appends_to_latest_session() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.toml"),
            "[launch]\ninter_attempt_delay_ms = 0\ngrace_period_secs = 1\n\
             [diagnostics]\ncommand_timeout_secs = 2\n",
        )
        .unwrap();
        let snapshot = write_snapshot(&dir, "{}");
        let browser = write_script(dir.path(), "browser", "echo 'No usable sandbox!' >&2; exit 1");

        ct(&dir)
            .args(["launch", "--no-flatpak", "--no-diagnostics", "--max-attempts", "1"])
            .arg("--executable")
            .arg(&browser)
            .arg("--snapshot")
            .arg(&snapshot)
            .assert()
            .code(3);

        let sessions = session_dirs(&dir);
        assert_eq!(sessions.len(), 1);
        let log_path = sessions[0].join("logs.jsonl");
        let before = fs::read_to_string(&log_path).unwrap().lines().count();

        ct(&dir)
            .arg("diag")
            .assert()
            .success()
            .stdout(predicate::str::contains("sandbox_issues"));

        let entries: Vec<serde_json::Value> = fs::read_to_string(&log_path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let added = &entries[before..];
        assert!(added.iter().any(|e| e["source"] == "dmesg"));
        assert!(added.iter().any(|e| e["source"] == "journal"));
        let issues = added
            .iter()
            .find(|e| e["source"] == "diagnostics" && e["level"] == "WARN")
            .expect("issue tags are recorded");
        assert_eq!(issues["metadata"]["trigger"], "diag");
        assert!(
            issues["metadata"]["issues"]
                .as_array()
                .unwrap()
                .iter()
                .any(|i| i == "sandbox_issues")
        );
    }
}
