use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::state::{RunState, StateMachine, Transition};
use crate::config::AppConfig;
use crate::diagnostics::{DiagnosticsCollector, FailureContext, NoDiagnostics, TelemetryMonitor};
use crate::errors::OrchestratorError;
use crate::lock::{LockHandle, LockManager};
use crate::logger::{ForensicLogger, Level, LoggerOptions};
use crate::session::{Session, SessionResult};
use crate::stage::{self, EnvSnapshot, Stage};
use crate::supervisor::{LaunchRequest, Outcome, ProcessSupervisor, SupervisorConfig};

const RUNNER_TARGET: &str = "chrome_troubleshooter::orchestrator";
const SOURCE: &str = "launcher";

/// Everything the orchestrator needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub lock_path: PathBuf,
    pub base_dir: PathBuf,
    pub max_attempts: usize,
    pub stability_window: Duration,
    pub inter_attempt_delay: Duration,
    pub base_flags: Vec<String>,
    pub extra_flags: Vec<String>,
    pub supervisor: SupervisorConfig,
    pub logger: LoggerOptions,
    /// How long a monitor gets to stop after its attempt ends.
    pub monitor_grace: Duration,
}

impl OrchestratorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            lock_path: config.lock_path(),
            base_dir: config.base_dir(),
            max_attempts: config.launch.max_attempts,
            stability_window: config.stability_window(),
            inter_attempt_delay: config.inter_attempt_delay(),
            base_flags: config.launch.base_flags.clone(),
            extra_flags: config.launch.extra_flags.clone(),
            supervisor: SupervisorConfig {
                grace_period: config.grace_period(),
                output_limit: config.logging.stderr_limit_bytes,
            },
            logger: LoggerOptions {
                enable_json: config.logging.enable_json,
                enable_sqlite: config.logging.enable_sqlite,
                echo: true,
                color: config.logging.color,
            },
            monitor_grace: config.monitor_grace(),
        }
    }
}

/// What a finished (successful or exhausted) session hands back.
///
/// The forensic record stays open so the caller can add follow-up entries
/// (such as an external fallback). The session-end entries are written by
/// [`SessionReport::close`] or when the report is dropped.
pub struct SessionReport {
    pub session: Session,
    pub logger: Arc<ForensicLogger>,
    /// Still held after success; the caller releases it (or drops it) at
    /// teardown. `None` after exhaustion.
    pub lock: Option<LockHandle>,
    pub transitions: Vec<Transition>,
}

impl SessionReport {
    pub fn result(&self) -> SessionResult {
        self.session.result.unwrap_or(SessionResult::Exhausted)
    }

    pub fn succeeded(&self) -> bool {
        self.result() == SessionResult::Success
    }

    /// Write the session-end entries. Later calls are no-ops.
    pub fn close(&self) {
        self.logger.close();
    }
}

impl Drop for SessionReport {
    fn drop(&mut self) {
        self.logger.close();
    }
}

enum LoopEnd {
    Success,
    Exhausted,
    Interrupted { attempt: usize },
}

/// Drives the stage list until one attempt is stable or the list runs out.
pub struct Orchestrator {
    config: OrchestratorConfig,
    supervisor: ProcessSupervisor,
    diagnostics: Arc<dyn DiagnosticsCollector>,
    monitor: Option<Arc<dyn TelemetryMonitor>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let supervisor = ProcessSupervisor::new(config.supervisor.clone());
        Self {
            config,
            supervisor,
            diagnostics: Arc::new(NoDiagnostics),
            monitor: None,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticsCollector>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn TelemetryMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run one launch session.
    ///
    /// Returns `Ok` for both success and exhaustion; check
    /// [`SessionReport::result`]. Fatal conditions (lock held, executable
    /// missing, cancellation, session storage failure) are errors. In every
    /// case that gets as far as creating the session directory, the forensic
    /// record and `summary.json` are on disk on return. An interrupted session
    /// is closed here; otherwise closing is left to the report.
    pub async fn run(
        &self,
        executable: &Path,
        snapshot: &EnvSnapshot,
        cancel: &CancellationToken,
    ) -> Result<SessionReport, OrchestratorError> {
        let mut states = StateMachine::new();

        if !executable.is_file() {
            return Err(OrchestratorError::ExecutableNotFound {
                path: executable.to_path_buf(),
            });
        }

        let mut lock = LockManager::new(&self.config.lock_path).acquire()?;
        states.transition(RunState::LockAcquired)?;

        let mut session = Session::create(&self.config.base_dir, executable, snapshot).map_err(
            |source| OrchestratorError::Session {
                path: self.config.base_dir.clone(),
                source,
            },
        )?;
        let logger = Arc::new(ForensicLogger::open(
            &session.dir,
            &session.id,
            self.config.logger.clone(),
        )?);

        info!(target: RUNNER_TARGET, session = %session.id, dir = %session.dir.display(), "session started");
        logger.write(
            SOURCE,
            Level::Info,
            &format!("Session started: {}", session.id),
            Some(json!({
                "executable": executable,
                "lock_path": lock.path(),
                "pid": lock.info().pid,
                "snapshot": snapshot,
                "stability_window_secs": self.config.stability_window.as_secs_f64(),
                "max_attempts": self.config.max_attempts,
            })),
        );

        let stages = stage::plan(snapshot, self.config.max_attempts);
        session.planned_stages = stages.iter().map(|s| s.name.clone()).collect();
        logger.write(
            SOURCE,
            Level::Info,
            &format!("Planned stages: {}", session.planned_stages.join(" -> ")),
            Some(json!({ "stages": &stages })),
        );

        let end = self
            .drive(&mut states, &mut session, &logger, &stages, executable, cancel)
            .await?;

        let result = match end {
            LoopEnd::Success => {
                states.transition(RunState::Success)?;
                SessionResult::Success
            }
            LoopEnd::Exhausted => {
                states.transition(RunState::Exhausted)?;
                logger.error(
                    SOURCE,
                    &format!("All {} stages failed; giving up", session.attempts.len()),
                );
                SessionResult::Exhausted
            }
            LoopEnd::Interrupted { .. } => {
                states.transition(RunState::Interrupted)?;
                logger.warn(SOURCE, "Launch interrupted; terminating and cleaning up");
                SessionResult::Interrupted
            }
        };

        session.finish(result);
        self.persist_summary(&session, &logger);
        logger.write(
            SOURCE,
            Level::Info,
            &format!("Session result: {}", result),
            Some(json!({ "result": result, "attempts": session.attempts.len() })),
        );
        states.transition(RunState::Done)?;

        match end {
            LoopEnd::Success => Ok(SessionReport {
                session,
                logger,
                lock: Some(lock),
                transitions: states.history().to_vec(),
            }),
            LoopEnd::Exhausted => {
                lock.release();
                Ok(SessionReport {
                    session,
                    logger,
                    lock: None,
                    transitions: states.history().to_vec(),
                })
            }
            LoopEnd::Interrupted { attempt } => {
                logger.close();
                lock.release();
                Err(OrchestratorError::Interrupted {
                    attempt,
                    session_dir: session.dir.clone(),
                })
            }
        }
    }

    async fn drive(
        &self,
        states: &mut StateMachine,
        session: &mut Session,
        logger: &Arc<ForensicLogger>,
        stages: &[Stage],
        executable: &Path,
        cancel: &CancellationToken,
    ) -> Result<LoopEnd, OrchestratorError> {
        let total = stages.len();

        for (index, stage) in stages.iter().enumerate() {
            let number = index + 1;
            states.transition(RunState::Attempting(index))?;

            if index > 0 && !self.config.inter_attempt_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.inter_attempt_delay) => {}
                    _ = cancel.cancelled() => return Ok(LoopEnd::Interrupted { attempt: number }),
                }
            }
            if cancel.is_cancelled() {
                return Ok(LoopEnd::Interrupted { attempt: number });
            }

            let args = build_args(&self.config.base_flags, stage, &self.config.extra_flags);
            logger.write(
                SOURCE,
                Level::Info,
                &format!(
                    "Attempt {}/{}: stage {} ({})",
                    number, total, stage.name, stage.description
                ),
                Some(json!({ "attempt": number, "stage": stage.name, "args": &args })),
            );

            let request = LaunchRequest {
                executable: executable.to_path_buf(),
                args,
                stability_window: self.config.stability_window,
                capture_path: session.capture_path(number),
            };

            let started_at = Local::now().fixed_offset();
            let monitor = self.start_monitor(logger, cancel);
            let launched = self.supervisor.launch(&request, cancel).await;
            self.stop_monitor(monitor, logger).await;

            let report = match launched {
                Ok(report) => report,
                Err(interrupted) => {
                    logger.write(
                        SOURCE,
                        Level::Warn,
                        &format!("Attempt {} interrupted", number),
                        Some(json!({ "attempt": number, "pid": interrupted.pid })),
                    );
                    return Ok(LoopEnd::Interrupted { attempt: number });
                }
            };

            let attempt = session.record(stage, started_at, &report).clone();
            let meta = json!({
                "attempt": number,
                "stage": stage.name,
                "pid": report.pid,
                "elapsed_ms": report.elapsed.as_millis() as u64,
                "outcome": &report.outcome,
            });

            match &report.outcome {
                Outcome::Stable => {
                    logger.write(
                        SOURCE,
                        Level::Success,
                        &format!(
                            "Stage {} is stable after {:.1}s (pid {})",
                            stage.name,
                            report.elapsed.as_secs_f64(),
                            report.pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                        ),
                        Some(meta),
                    );
                    return Ok(LoopEnd::Success);
                }
                Outcome::EarlyExit {
                    code,
                    signal,
                    output,
                } => {
                    let how = match (code, signal) {
                        (Some(code), _) => format!("exit code {}", code),
                        (None, Some(signal)) => format!("signal {}", signal),
                        (None, None) => "unknown status".to_string(),
                    };
                    logger.write(
                        SOURCE,
                        Level::Error,
                        &format!(
                            "Stage {} exited early with {} after {:.1}s",
                            stage.name,
                            how,
                            report.elapsed.as_secs_f64()
                        ),
                        Some(meta),
                    );
                    if !output.trim().is_empty() {
                        logger.write(
                            "browser",
                            Level::Info,
                            output,
                            Some(json!({ "attempt": number, "capture": &attempt.capture_path })),
                        );
                    }
                }
                Outcome::LaunchError { reason } => {
                    logger.write(
                        SOURCE,
                        Level::Error,
                        &format!("Stage {} could not be launched: {}", stage.name, reason),
                        Some(meta),
                    );
                }
            }

            let ctx = FailureContext {
                attempt: number,
                stage: stage.clone(),
                started_at,
                outcome: report.outcome.clone(),
                capture_path: attempt.capture_path.clone(),
            };
            let diagnostics = tokio::select! {
                report = self.diagnostics.collect(&ctx) => report,
                _ = cancel.cancelled() => return Ok(LoopEnd::Interrupted { attempt: number }),
            };
            diagnostics.record(logger, json!({ "attempt": number }));
        }

        Ok(LoopEnd::Exhausted)
    }

    fn start_monitor(
        &self,
        logger: &Arc<ForensicLogger>,
        cancel: &CancellationToken,
    ) -> Option<RunningMonitor> {
        let monitor = Arc::clone(self.monitor.as_ref()?);
        let name = monitor.name();
        let token = cancel.child_token();
        let run_logger = Arc::clone(logger);
        let run_token = token.clone();
        debug!(target: RUNNER_TARGET, monitor = name, "starting monitor");
        let handle = tokio::spawn(async move { monitor.run(run_logger, run_token).await });
        Some(RunningMonitor {
            name,
            token,
            handle,
        })
    }

    async fn stop_monitor(&self, monitor: Option<RunningMonitor>, logger: &ForensicLogger) {
        let Some(RunningMonitor {
            name,
            token,
            mut handle,
        }) = monitor
        else {
            return;
        };
        token.cancel();
        if tokio::time::timeout(self.config.monitor_grace, &mut handle)
            .await
            .is_err()
        {
            handle.abort();
            logger.write(
                SOURCE,
                Level::Warn,
                &format!(
                    "Monitor {} did not stop within {}ms; aborted",
                    name,
                    self.config.monitor_grace.as_millis()
                ),
                Some(json!({ "monitor": name })),
            );
        }
    }

    fn persist_summary(&self, session: &Session, logger: &ForensicLogger) {
        match session.write_summary() {
            Ok(path) => {
                logger.write(
                    SOURCE,
                    Level::Debug,
                    "Session summary written",
                    Some(json!({ "path": path })),
                );
            }
            Err(err) => {
                error!(target: RUNNER_TARGET, session = %session.id, error = %err, "failed to write summary");
                logger.error(SOURCE, &format!("Failed to write session summary: {}", err));
            }
        }
    }
}

/// A monitor task bound to one attempt.
struct RunningMonitor {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Argument vector for one attempt: base flags, then stage flags, then
/// user-supplied extras.
pub fn build_args(base_flags: &[String], stage: &Stage, extra_flags: &[String]) -> Vec<String> {
    base_flags
        .iter()
        .chain(&stage.flags)
        .chain(extra_flags)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LockError;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> OrchestratorConfig {
        OrchestratorConfig {
            lock_path: dir.path().join("ct.lock"),
            base_dir: dir.path().join("sessions"),
            max_attempts: 4,
            stability_window: Duration::from_millis(500),
            inter_attempt_delay: Duration::ZERO,
            base_flags: vec![],
            extra_flags: vec![],
            supervisor: SupervisorConfig {
                grace_period: Duration::from_millis(300),
                output_limit: 1024,
            },
            logger: LoggerOptions::quiet(),
            monitor_grace: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_build_args_order() {
        let stage = stage::select(&EnvSnapshot::default())
            .into_iter()
            .find(|s| s.name == stage::NO_GPU)
            .unwrap();
        let args = build_args(
            &["--enable-logging=stderr".to_string()],
            &stage,
            &["--user-data-dir=/tmp/p".to_string()],
        );
        assert_eq!(
            args,
            vec![
                "--enable-logging=stderr",
                "--disable-gpu",
                "--disable-gpu-compositing",
                "--user-data-dir=/tmp/p"
            ]
        );
    }

    #[test]
    fn test_from_app_config() {
        let mut app = AppConfig::default();
        app.launch.max_attempts = 2;
        app.logging.enable_sqlite = false;
        let cfg = OrchestratorConfig::from_app_config(&app);

        assert_eq!(cfg.max_attempts, 2);
        assert_eq!(cfg.stability_window, Duration::from_secs(10));
        assert!(!cfg.logger.enable_sqlite);
        assert_eq!(cfg.base_flags, app.launch.base_flags);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_before_lock() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir));

        let err = orchestrator
            .run(
                &dir.path().join("no-browser"),
                &EnvSnapshot::default(),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, OrchestratorError::ExecutableNotFound { .. }));
        assert!(!dir.path().join("ct.lock").exists());
        assert!(!dir.path().join("sessions").exists());
    }

    #[tokio::test]
    async fn test_held_lock_is_already_running() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let _held = LockManager::new(&cfg.lock_path).acquire().unwrap();

        let err = Orchestrator::new(cfg)
            .run(
                Path::new("/bin/sh"),
                &EnvSnapshot::default(),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, OrchestratorError::AlreadyRunning { .. }));
        assert!(!dir.path().join("sessions").exists(), "No session without the lock");
    }

    #[tokio::test]
    async fn test_unusable_base_dir_is_session_error_and_releases_lock() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file").unwrap();
        cfg.base_dir = blocker.join("sessions");
        let lock_path = cfg.lock_path.clone();

        let err = Orchestrator::new(cfg)
            .run(
                Path::new("/bin/sh"),
                &EnvSnapshot::default(),
                &CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();

        assert!(matches!(err, OrchestratorError::Session { .. }));
        assert!(
            !matches!(
                LockManager::new(&lock_path).acquire(),
                Err(LockError::AlreadyRunning { .. })
            ),
            "Lock must be released on error"
        );
    }
}
