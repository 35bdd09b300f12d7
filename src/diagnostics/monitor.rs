//! Side-channel monitors that run alongside an attempt.
//!
//! A monitor is started when an attempt starts and cancelled when the
//! supervisor returns. It writes what it sees into the forensic record and
//! never blocks or influences the attempt.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RELEVANT_KERNEL_LINE;
use crate::logger::ForensicLogger;

const MONITOR_TARGET: &str = "chrome_troubleshooter::monitor";

#[async_trait]
pub trait TelemetryMonitor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Observe until `cancel` fires. Must return promptly after cancellation.
    async fn run(&self, logger: Arc<ForensicLogger>, cancel: CancellationToken);
}

/// Follows the kernel ring buffer and logs browser-related lines.
#[derive(Debug, Clone)]
pub struct KernelLogMonitor {
    program: String,
    args: Vec<String>,
    window: Duration,
}

impl KernelLogMonitor {
    /// Follow new kernel messages for at most `window`.
    pub fn new(window: Duration) -> Self {
        Self {
            program: "dmesg".to_string(),
            args: vec!["--time-format=iso".to_string(), "--follow-new".to_string()],
            window,
        }
    }

    /// Follow the output of a different command instead of `dmesg`.
    pub fn with_command(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.program = program.into();
        self.args = args;
        self
    }
}

#[async_trait]
impl TelemetryMonitor for KernelLogMonitor {
    fn name(&self) -> &'static str {
        "kernel"
    }

    async fn run(&self, logger: Arc<ForensicLogger>, cancel: CancellationToken) {
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                logger.debug("dmesg", &format!("kernel monitor unavailable: {}", error));
                return;
            }
        };

        let Some(stdout) = child.stdout.take() else {
            return;
        };
        let mut lines = BufReader::new(stdout).lines();
        let deadline = tokio::time::sleep(self.window);
        tokio::pin!(deadline);

        let mut seen = 0usize;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut deadline => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if RELEVANT_KERNEL_LINE.is_match(&line) {
                            seen += 1;
                            let writer = Arc::clone(&logger);
                            let written = tokio::task::spawn_blocking(move || {
                                writer.info("dmesg", line.trim());
                            })
                            .await;
                            if written.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) | Err(_) => break,
                },
            }
        }

        let _ = child.start_kill();
        let _ = child.wait().await;
        debug!(target: MONITOR_TARGET, seen, "kernel monitor stopped");
    }
}
