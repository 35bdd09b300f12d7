//! Progressive browser launch (`launch`).

use anyhow::Result;
use console::style;
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chrome_troubleshooter::config::AppConfig;
use chrome_troubleshooter::diagnostics::{KernelLogMonitor, SystemDiagnostics};
use chrome_troubleshooter::errors::OrchestratorError;
use chrome_troubleshooter::logger::{ForensicLogger, Level};
use chrome_troubleshooter::orchestrator::{Orchestrator, OrchestratorConfig, SessionReport};
use chrome_troubleshooter::supervisor::{LaunchRequest, ProcessSupervisor};

use super::stages::resolve_snapshot;

const LAUNCH_TARGET: &str = "chrome_troubleshooter::launch";
const FLATPAK_SOURCE: &str = "flatpak";
const FLATPAK_CAPTURE: &str = "flatpak.out";

pub const EXIT_ALREADY_RUNNING: u8 = 1;
pub const EXIT_EXECUTABLE_NOT_FOUND: u8 = 2;
pub const EXIT_EXHAUSTED: u8 = 3;
pub const EXIT_INTERRUPTED: u8 = 130;

/// Binary names searched on `PATH`, most preferred first.
const CANDIDATE_NAMES: &[&str] = &[
    "google-chrome-stable",
    "google-chrome",
    "chromium",
    "chromium-browser",
    "chrome",
];

const WELL_KNOWN_PATHS: &[&str] = &[
    "/opt/google/chrome/chrome",
    "/usr/lib/chromium/chromium",
    "/usr/lib/chromium-browser/chromium-browser",
    "/snap/bin/chromium",
];

/// `launch` flags that override the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub executable: Option<PathBuf>,
    pub snapshot: Option<PathBuf>,
    pub max_attempts: Option<usize>,
    pub timeout: Option<u64>,
    pub extra_flags: Vec<String>,
    pub no_flatpak: bool,
    pub no_diagnostics: bool,
    pub kernel_monitor: bool,
}

impl LaunchOptions {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(n) = self.max_attempts {
            config.launch.max_attempts = n;
        }
        if let Some(secs) = self.timeout {
            config.launch.stability_window_secs = secs;
        }
        config.launch.extra_flags.extend(self.extra_flags.iter().cloned());
        if self.no_flatpak {
            config.launch.flatpak_fallback = false;
        }
        if self.no_diagnostics {
            config.diagnostics.enabled = false;
        }
        if self.kernel_monitor {
            config.diagnostics.kernel_monitor = true;
        }
        config.clamp();
    }
}

pub async fn cmd_launch(mut config: AppConfig, opts: LaunchOptions) -> Result<ExitCode> {
    opts.apply(&mut config);

    let executable = opts
        .executable
        .clone()
        .or_else(|| config.launch.executable.clone())
        .or_else(|| discover_executable(std::env::var_os("PATH").as_deref()));

    let Some(executable) = executable else {
        eprintln!(
            "{} No Chrome or Chromium executable found. Pass --executable or set CT_CHROME_PATH.",
            style("✗").red().bold()
        );
        return Ok(ExitCode::from(EXIT_EXECUTABLE_NOT_FOUND));
    };

    let snapshot = resolve_snapshot(opts.snapshot.as_deref()).await?;
    let orchestrator = build_orchestrator(&config, &executable);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    info!(target: LAUNCH_TARGET, executable = %executable.display(), "starting launch session");

    match orchestrator.run(&executable, &snapshot, &cancel).await {
        Ok(report) if report.succeeded() => {
            print_success(&report);
            Ok(ExitCode::SUCCESS)
        }
        Ok(report) => {
            println!(
                "{} All {} stage(s) failed. Logs: {}",
                style("✗").red().bold(),
                report.session.attempts.len(),
                report.session.dir.display()
            );
            let recovered = config.launch.flatpak_fallback
                && try_flatpak(
                    &config,
                    &report.logger,
                    std::env::var_os("PATH").as_deref(),
                    &cancel,
                )
                .await;
            report.close();
            if recovered {
                return Ok(ExitCode::SUCCESS);
            }
            Ok(ExitCode::from(EXIT_EXHAUSTED))
        }
        Err(err @ OrchestratorError::AlreadyRunning { .. }) => {
            eprintln!("{} {}", style("✗").red().bold(), err);
            Ok(ExitCode::from(EXIT_ALREADY_RUNNING))
        }
        Err(err @ OrchestratorError::ExecutableNotFound { .. }) => {
            eprintln!("{} {}", style("✗").red().bold(), err);
            Ok(ExitCode::from(EXIT_EXECUTABLE_NOT_FOUND))
        }
        Err(OrchestratorError::Interrupted {
            attempt,
            session_dir,
        }) => {
            eprintln!(
                "{} Interrupted during attempt {}. Logs: {}",
                style("!").yellow().bold(),
                attempt,
                session_dir.display()
            );
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(err) => Err(err.into()),
    }
}

fn build_orchestrator(config: &AppConfig, executable: &Path) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(OrchestratorConfig::from_app_config(config));

    if config.diagnostics.enabled {
        let mut diagnostics =
            SystemDiagnostics::new(config.diagnostics.journal_lines, config.command_timeout());
        if let Some(name) = executable.file_name().and_then(OsStr::to_str) {
            diagnostics = diagnostics.with_comm(name);
        }
        orchestrator = orchestrator.with_diagnostics(Arc::new(diagnostics));
    }
    if config.diagnostics.kernel_monitor {
        orchestrator =
            orchestrator.with_monitor(Arc::new(KernelLogMonitor::new(config.stability_window())));
    }
    orchestrator
}

fn print_success(report: &SessionReport) {
    let stage = report
        .session
        .successful_attempt()
        .map(|a| a.stage.name.as_str())
        .unwrap_or("?");
    println!(
        "{} Browser launched with stage {}. Logs: {}",
        style("✓").green().bold(),
        style(stage).bold(),
        report.session.dir.display()
    );
}

/// Last resort after every stage failed: run Flatpak Chromium under the same
/// stability rule. The attempt's output lands next to the session's captures
/// and every step is recorded in the session's forensic log.
async fn try_flatpak(
    config: &AppConfig,
    logger: &ForensicLogger,
    path_var: Option<&OsStr>,
    cancel: &CancellationToken,
) -> bool {
    let app_id = &config.launch.flatpak_app_id;
    logger.info(
        FLATPAK_SOURCE,
        &format!("Trying Flatpak Chromium fallback ({})", app_id),
    );

    let Some(flatpak) = find_in_path("flatpak", path_var) else {
        info!(target: LAUNCH_TARGET, "flatpak not installed; skipping fallback");
        logger.warn(FLATPAK_SOURCE, "Flatpak not available; skipping fallback");
        return false;
    };

    let orchestrator_config = OrchestratorConfig::from_app_config(config);
    let supervisor = ProcessSupervisor::new(orchestrator_config.supervisor);
    let request = LaunchRequest {
        executable: flatpak,
        args: vec!["run".to_string(), app_id.clone()],
        stability_window: config.stability_window(),
        capture_path: logger.dir().join(FLATPAK_CAPTURE),
    };

    match supervisor.launch(&request, cancel).await {
        Ok(report) => {
            let meta = json!({
                "executable": &request.executable,
                "args": &request.args,
                "pid": report.pid,
                "elapsed_ms": report.elapsed.as_millis() as u64,
                "outcome": &report.outcome,
                "capture": &request.capture_path,
            });
            if report.outcome.is_stable() {
                logger.write(
                    FLATPAK_SOURCE,
                    Level::Success,
                    &format!("Flatpak {} is stable", app_id),
                    Some(meta),
                );
                true
            } else {
                warn!(target: LAUNCH_TARGET, outcome = report.outcome.label(), "flatpak fallback failed");
                logger.write(
                    FLATPAK_SOURCE,
                    Level::Error,
                    &format!("Flatpak fallback failed ({})", report.outcome.label()),
                    Some(meta),
                );
                false
            }
        }
        Err(interrupted) => {
            logger.write(
                FLATPAK_SOURCE,
                Level::Warn,
                "Flatpak fallback interrupted",
                Some(json!({ "pid": interrupted.pid })),
            );
            false
        }
    }
}

/// First candidate browser on `path_var`, then the well-known install paths.
pub fn discover_executable(path_var: Option<&OsStr>) -> Option<PathBuf> {
    CANDIDATE_NAMES
        .iter()
        .find_map(|name| find_in_path(name, path_var))
        .or_else(|| {
            WELL_KNOWN_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| is_executable(p))
        })
}

pub fn find_in_path(name: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
