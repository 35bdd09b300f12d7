//! On-demand system diagnostics (`diag`).
//!
//! Appends kernel messages, recent journal entries and issue tags to an
//! existing session record, by default the latest one.

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, Local, TimeDelta};
use console::style;
use serde_json::json;
use std::ffi::OsStr;

use chrome_troubleshooter::config::AppConfig;
use chrome_troubleshooter::diagnostics::SystemDiagnostics;
use chrome_troubleshooter::logger::ForensicLogger;
use chrome_troubleshooter::orchestrator::OrchestratorConfig;
use chrome_troubleshooter::session::{SessionInfo, latest_session, list_sessions};
use chrome_troubleshooter::supervisor::Outcome;

/// How far back kernel messages go when the session has no summary.
fn fallback_lookback() -> TimeDelta {
    TimeDelta::hours(1)
}

pub async fn cmd_diag(config: &AppConfig, session: Option<&str>) -> Result<()> {
    let base_dir = config.base_dir();
    let info = match session {
        Some(name) => list_sessions(&base_dir)?
            .into_iter()
            .find(|s| s.id == name)
            .with_context(|| format!("No session '{}' in {}", name, base_dir.display()))?,
        None => latest_session(&base_dir)?
            .with_context(|| format!("No sessions found in {}", base_dir.display()))?,
    };

    let mut diagnostics =
        SystemDiagnostics::new(config.diagnostics.journal_lines, config.command_timeout());
    if let Some(comm) = session_comm(&info) {
        diagnostics = diagnostics.with_comm(comm);
    }

    let since = session_start(&info);
    let outputs = failed_outputs(&info);
    let extra: Vec<&str> = outputs.iter().map(String::as_str).collect();
    let report = diagnostics.sweep(since, &extra).await;

    let mut options = OrchestratorConfig::from_app_config(config).logger;
    options.echo = false;
    let logger = ForensicLogger::open(&info.dir, &info.id, options)
        .with_context(|| format!("Failed to open session record in {}", info.dir.display()))?;
    logger.info(
        "diagnostics",
        &format!("On-demand diagnostics since {}", since.to_rfc3339()),
    );
    report.record(&logger, json!({ "trigger": "diag" }));
    logger.close();

    println!();
    println!("{} {}", style("Session:").bold(), info.id);
    for block in &report.blocks {
        println!();
        println!("{}", style(format!("[{}]", block.source)).cyan().bold());
        println!("{}", block.content);
    }
    println!();
    if report.issues.is_empty() {
        println!("{}", style("No known crash signatures detected").green());
    } else {
        let names: Vec<_> = report.issues.iter().map(|i| i.as_str()).collect();
        println!("{} {}", style("Detected issues:").yellow().bold(), names.join(", "));
    }
    println!("Recorded in {}", info.dir.display());
    Ok(())
}

fn session_start(info: &SessionInfo) -> DateTime<FixedOffset> {
    info.summary
        .as_ref()
        .map(|s| s.started_at)
        .unwrap_or_else(|| (Local::now() - fallback_lookback()).fixed_offset())
}

fn session_comm(info: &SessionInfo) -> Option<String> {
    let summary = info.summary.as_ref()?;
    summary
        .executable
        .file_name()
        .and_then(OsStr::to_str)
        .map(str::to_string)
}

/// Captured output of every attempt that exited early.
fn failed_outputs(info: &SessionInfo) -> Vec<String> {
    let Some(summary) = &info.summary else {
        return Vec::new();
    };
    summary
        .attempts
        .iter()
        .filter_map(|attempt| match &attempt.outcome {
            Outcome::EarlyExit { output, .. } => Some(output.clone()),
            _ => None,
        })
        .collect()
}
