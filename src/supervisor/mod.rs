//! Single-attempt process supervision.
//!
//! Each attempt runs in its own process group so the whole tree the browser
//! forks (zygote, GPU and renderer processes) can be signalled as a unit.
//! The supervisor waits for exactly one thing: the first of child exit,
//! stability window expiry, or cancellation.
//!
//! Cleanup guarantee: for every outcome except [`Outcome::Stable`], the
//! process group is gone by the time `launch` returns (SIGTERM, then SIGKILL
//! after the grace period). A stable child is handed off and left running.

pub mod capture;

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SUPERVISOR_TARGET: &str = "chrome_troubleshooter::supervisor";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Still running when the stability window closed.
    Stable,
    /// Exited before the stability window closed.
    EarlyExit {
        code: Option<i32>,
        signal: Option<i32>,
        /// Tail of the capture file: stdout and stderr interleaved.
        #[serde(alias = "stderr")]
        output: String,
    },
    /// Could not be started at all.
    LaunchError { reason: String },
}

impl Outcome {
    pub fn is_stable(&self) -> bool {
        matches!(self, Outcome::Stable)
    }

    /// Short label used in log lines and summaries.
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Stable => "stable",
            Outcome::EarlyExit { .. } => "early_exit",
            Outcome::LaunchError { .. } => "launch_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Upper bound on captured output returned in `EarlyExit`.
    pub output_limit: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            output_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub stability_window: Duration,
    /// File receiving the child's stdout and stderr.
    pub capture_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub pid: Option<u32>,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

/// Cancellation fired while an attempt was running. The child's process
/// group has already been terminated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("launch interrupted (pid {pid:?})")]
pub struct LaunchInterrupted {
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run one attempt and classify it.
    pub async fn launch(
        &self,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> Result<LaunchReport, LaunchInterrupted> {
        let started = Instant::now();

        if cancel.is_cancelled() {
            return Err(LaunchInterrupted { pid: None });
        }

        let mut child = match self.spawn(request) {
            Ok(child) => child,
            Err(reason) => {
                warn!(target: SUPERVISOR_TARGET, executable = %request.executable.display(), %reason, "spawn failed");
                return Ok(LaunchReport {
                    pid: None,
                    outcome: Outcome::LaunchError { reason },
                    elapsed: started.elapsed(),
                });
            }
        };

        let pid = child.id();
        info!(target: SUPERVISOR_TARGET, ?pid, window_secs = request.stability_window.as_secs_f64(), "child spawned");

        tokio::select! {
            status = child.wait() => {
                let outcome = match status {
                    Ok(status) => {
                        let output = capture::read_tail(&request.capture_path, self.config.output_limit)
                            .unwrap_or_else(|error| format!("<capture unreadable: {}>", error));
                        Outcome::EarlyExit {
                            code: status.code(),
                            signal: status.signal(),
                            output,
                        }
                    }
                    Err(error) => Outcome::LaunchError {
                        reason: format!("failed to wait for child: {}", error),
                    },
                };
                if let Some(pid) = pid {
                    reap_group(pid, self.config.grace_period).await;
                }
                debug!(target: SUPERVISOR_TARGET, ?pid, outcome = outcome.label(), "child exited early");
                Ok(LaunchReport { pid, outcome, elapsed: started.elapsed() })
            }
            _ = tokio::time::sleep(request.stability_window) => {
                info!(target: SUPERVISOR_TARGET, ?pid, "child survived stability window; handing off");
                Ok(LaunchReport { pid, outcome: Outcome::Stable, elapsed: started.elapsed() })
            }
            _ = cancel.cancelled() => {
                warn!(target: SUPERVISOR_TARGET, ?pid, "cancelled; terminating process group");
                self.terminate(&mut child, pid).await;
                Err(LaunchInterrupted { pid })
            }
        }
    }

    fn spawn(&self, request: &LaunchRequest) -> Result<Child, String> {
        let (stdout, stderr) = capture::open(&request.capture_path).map_err(|e| {
            format!(
                "failed to open capture file {}: {}",
                request.capture_path.display(),
                e
            )
        })?;

        Command::new(&request.executable)
            .args(&request.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .spawn()
            .map_err(|e| format!("failed to spawn {}: {}", request.executable.display(), e))
    }

    /// SIGTERM the group, reap the leader, SIGKILL if it outlives the grace
    /// period, then sweep any remaining group members.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        let Some(pid) = pid else {
            let _ = child.kill().await;
            return;
        };
        let pgid = pid as libc::pid_t;

        let _ = signal_group(pgid, libc::SIGTERM);
        if tokio::time::timeout(self.config.grace_period, child.wait())
            .await
            .is_err()
        {
            warn!(target: SUPERVISOR_TARGET, pid, "grace period elapsed; sending SIGKILL");
            let _ = signal_group(pgid, libc::SIGKILL);
            let _ = child.wait().await;
        }
        reap_group(pid, self.config.grace_period).await;
    }
}

/// Make sure no member of process group `pgid` survives.
///
/// Returns `true` when SIGKILL was needed.
pub async fn reap_group(pgid: u32, grace: Duration) -> bool {
    let pgid = pgid as libc::pid_t;
    if !group_alive(pgid) {
        return false;
    }

    debug!(target: SUPERVISOR_TARGET, pgid, "terminating leftover group members");
    let _ = signal_group(pgid, libc::SIGTERM);

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !group_alive(pgid) {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    if group_alive(pgid) {
        warn!(target: SUPERVISOR_TARGET, pgid, "group ignored SIGTERM; sending SIGKILL");
        let _ = signal_group(pgid, libc::SIGKILL);
        return true;
    }
    false
}

fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> std::io::Result<()> {
    // SAFETY: `killpg(2)` only takes integers; an invalid or empty group
    // makes the kernel return ESRCH, which we report as an io::Error.
    let result = unsafe { libc::killpg(pgid, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

fn group_alive(pgid: libc::pid_t) -> bool {
    match signal_group(pgid, 0) {
        Ok(()) => true,
        Err(err) => err.raw_os_error() == Some(libc::EPERM),
    }
}
