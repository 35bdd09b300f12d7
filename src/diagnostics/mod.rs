//! Post-failure diagnostics.
//!
//! After an attempt fails the orchestrator asks a [`DiagnosticsCollector`]
//! for context and writes whatever comes back into the forensic record
//! verbatim. Diagnostics never influence which stage runs next.
//!
//! [`SystemDiagnostics`] gathers kernel messages since the attempt started
//! and the browser's recent journal entries, then tags recognisable crash
//! patterns across those and the attempt's captured output.

pub mod monitor;

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::logger::{ForensicLogger, Level};
use crate::stage::Stage;
use crate::supervisor::Outcome;

pub use monitor::{KernelLogMonitor, TelemetryMonitor};

const DIAGNOSTICS_TARGET: &str = "chrome_troubleshooter::diagnostics";

/// Kernel lines worth keeping.
pub(crate) static RELEVANT_KERNEL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)chrome|chromium|gpu|i915|amdgpu|nvidia|seccomp|oom|segfault|vaapi").unwrap()
});

/// Recognised crash signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    SeccompIssues,
    GpuHangs,
    GpuProcessCrash,
    OomKills,
    Segfaults,
    VaapiErrors,
    WaylandIssues,
    SandboxIssues,
}

impl Issue {
    pub fn as_str(self) -> &'static str {
        match self {
            Issue::SeccompIssues => "seccomp_issues",
            Issue::GpuHangs => "gpu_hangs",
            Issue::GpuProcessCrash => "gpu_process_crash",
            Issue::OomKills => "oom_kills",
            Issue::Segfaults => "segfaults",
            Issue::VaapiErrors => "vaapi_errors",
            Issue::WaylandIssues => "wayland_issues",
            Issue::SandboxIssues => "sandbox_issues",
        }
    }
}

static ISSUE_PATTERNS: LazyLock<Vec<(Issue, Regex)>> = LazyLock::new(|| {
    [
        (Issue::SeccompIssues, r"(?i)seccomp.*chrom|chrom.*seccomp"),
        (Issue::GpuHangs, r"(?i)(i915|amdgpu|gpu).*hang|ring.*timeout"),
        (
            Issue::GpuProcessCrash,
            r"(?i)gpu process.*(crash|exit|died)|gpu_process_host.*(crash|exit)",
        ),
        (Issue::OomKills, r"(?i)oom-kill.*chrom|chrom.*killed.*memory|out of memory.*chrom"),
        (Issue::Segfaults, r"(?i)chrom.*(segfault|sigsegv)"),
        (Issue::VaapiErrors, r"(?i)vaapi.*(error|fail)|va-api.*fail|vaInitialize failed"),
        (Issue::WaylandIssues, r"(?i)wayland.*(error|fail)"),
        (Issue::SandboxIssues, r"(?i)no usable sandbox|setuid sandbox|namespace sandbox.*fail"),
    ]
    .into_iter()
    .map(|(issue, pattern)| (issue, Regex::new(pattern).unwrap()))
    .collect()
});

/// Everything a collector may want to know about a failed attempt.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub attempt: usize,
    pub stage: Stage,
    pub started_at: DateTime<FixedOffset>,
    pub outcome: Outcome,
    pub capture_path: PathBuf,
}

impl FailureContext {
    /// Captured output carried by the outcome, if any.
    pub fn output(&self) -> &str {
        match &self.outcome {
            Outcome::EarlyExit { output, .. } => output,
            _ => "",
        }
    }
}

/// A titled chunk of diagnostic text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticBlock {
    pub source: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub blocks: Vec<DiagnosticBlock>,
    pub issues: Vec<Issue>,
}

impl DiagnosticReport {
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.issues.is_empty()
    }

    /// Write every block verbatim at INFO under its own source, then one
    /// WARN entry naming the detected issues. `context` is attached to each
    /// entry; the issue entry also carries the tags under `issues`.
    pub fn record(&self, logger: &ForensicLogger, context: serde_json::Value) {
        for block in &self.blocks {
            logger.write(&block.source, Level::Info, &block.content, Some(context.clone()));
        }
        if self.issues.is_empty() {
            return;
        }
        let names: Vec<_> = self.issues.iter().map(|i| i.as_str()).collect();
        let mut meta = context;
        if let Some(fields) = meta.as_object_mut() {
            fields.insert("issues".to_string(), serde_json::json!(&self.issues));
        }
        logger.write(
            "diagnostics",
            Level::Warn,
            &format!("Detected issues: {}", names.join(", ")),
            Some(meta),
        );
    }
}

/// Source of post-failure context.
#[async_trait]
pub trait DiagnosticsCollector: Send + Sync {
    async fn collect(&self, ctx: &FailureContext) -> DiagnosticReport;
}

/// Collects nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDiagnostics;

#[async_trait]
impl DiagnosticsCollector for NoDiagnostics {
    async fn collect(&self, _ctx: &FailureContext) -> DiagnosticReport {
        DiagnosticReport::default()
    }
}

/// Kernel ring buffer and journal, plus crash-pattern tagging.
#[derive(Debug, Clone)]
pub struct SystemDiagnostics {
    journal_lines: usize,
    command_timeout: Duration,
    /// `_COMM` match for journalctl; the kernel truncates it to 15 bytes.
    comm: String,
}

impl SystemDiagnostics {
    pub fn new(journal_lines: usize, command_timeout: Duration) -> Self {
        Self {
            journal_lines,
            command_timeout,
            comm: "chrome".to_string(),
        }
    }

    pub fn with_comm(mut self, comm: impl Into<String>) -> Self {
        let mut comm: String = comm.into();
        comm.truncate(15);
        self.comm = comm;
        self
    }

    /// Kernel messages since `since` and the recent journal, with issues
    /// tagged across both and any `extra` text.
    pub async fn sweep(&self, since: DateTime<FixedOffset>, extra: &[&str]) -> DiagnosticReport {
        let (kernel, journal) = tokio::join!(self.kernel_messages(since), self.journal());

        let mut texts = vec![kernel.content.as_str(), journal.content.as_str()];
        texts.extend_from_slice(extra);
        let issues = analyze(&texts);

        DiagnosticReport {
            blocks: vec![kernel, journal],
            issues,
        }
    }

    async fn kernel_messages(&self, since: DateTime<FixedOffset>) -> DiagnosticBlock {
        let since = since.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
        let content = match run_capture(
            "dmesg",
            &["--since", &since, "--time-format", "iso"],
            self.command_timeout,
        )
        .await
        {
            Ok(output) => {
                let relevant = filter_relevant(&output);
                if relevant.is_empty() {
                    "no relevant kernel messages".to_string()
                } else {
                    relevant
                }
            }
            Err(reason) => format!("dmesg unavailable: {}", reason),
        };
        DiagnosticBlock {
            source: "dmesg".to_string(),
            content,
        }
    }

    async fn journal(&self) -> DiagnosticBlock {
        let lines = self.journal_lines.to_string();
        let comm = format!("_COMM={}", self.comm);
        let content = match run_capture(
            "journalctl",
            &["-n", &lines, "--no-pager", &comm],
            self.command_timeout,
        )
        .await
        {
            Ok(output) if output.trim().is_empty() => "no journal entries".to_string(),
            Ok(output) => output.trim_end().to_string(),
            Err(reason) => format!("journalctl unavailable: {}", reason),
        };
        DiagnosticBlock {
            source: "journal".to_string(),
            content,
        }
    }
}

#[async_trait]
impl DiagnosticsCollector for SystemDiagnostics {
    async fn collect(&self, ctx: &FailureContext) -> DiagnosticReport {
        let report = self.sweep(ctx.started_at, &[ctx.output()]).await;
        debug!(target: DIAGNOSTICS_TARGET, attempt = ctx.attempt, issues = ?report.issues, "diagnostics collected");
        report
    }
}

/// Keep only kernel lines mentioning the browser, GPU drivers or crash
/// mechanisms.
pub fn filter_relevant(output: &str) -> String {
    output
        .lines()
        .filter(|line| RELEVANT_KERNEL_LINE.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tag every recognised crash signature found in any of `texts`, in a fixed
/// order, each at most once.
pub fn analyze(texts: &[&str]) -> Vec<Issue> {
    ISSUE_PATTERNS
        .iter()
        .filter(|(_, pattern)| {
            texts
                .iter()
                .any(|text| text.lines().any(|line| pattern.is_match(line)))
        })
        .map(|(issue, _)| *issue)
        .collect()
}

async fn run_capture(program: &str, args: &[&str], limit: Duration) -> Result<String, String> {
    let output = Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, output).await {
        Ok(Ok(output)) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(Ok(output)) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{} ({})", output.status, stderr.trim()))
        }
        Ok(Err(error)) => Err(error.to_string()),
        Err(_) => Err(format!("timed out after {}s", limit.as_secs())),
    }
}
