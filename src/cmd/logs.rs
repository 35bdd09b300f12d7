//! Session log inspection (`logs`).

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;

use chrome_troubleshooter::config::AppConfig;
use chrome_troubleshooter::logger::{LogEntry, jsonl, read_entries, sqlite, text};
use chrome_troubleshooter::session::{SessionInfo, latest_session, list_sessions};

pub fn cmd_logs(
    config: &AppConfig,
    list: bool,
    latest: bool,
    session: Option<&str>,
    format: &str,
) -> Result<()> {
    let json = match format {
        "text" => false,
        "json" => true,
        other => bail!("Unknown format '{}': expected text or json", other),
    };
    let base_dir = config.base_dir();

    if let Some(name) = session {
        let info = list_sessions(&base_dir)?
            .into_iter()
            .find(|s| s.id == name)
            .with_context(|| format!("No session '{}' in {}", name, base_dir.display()))?;
        return show_session(&info, json);
    }

    if latest && !list {
        return match latest_session(&base_dir)? {
            Some(info) => show_session(&info, json),
            None => {
                println!("No sessions found in {}", base_dir.display());
                Ok(())
            }
        };
    }

    show_list(&base_dir, json)
}

fn show_list(base_dir: &Path, json: bool) -> Result<()> {
    let sessions = list_sessions(base_dir)?;

    if json {
        let out: Vec<_> = sessions
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "dir": s.dir,
                    "result": s.summary.as_ref().and_then(|x| x.result),
                    "attempts": s.summary.as_ref().map(|x| x.attempts.len()),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if sessions.is_empty() {
        println!("No sessions found in {}", base_dir.display());
        return Ok(());
    }

    println!();
    println!("Sessions in {}", base_dir.display());
    println!();
    println!("{:<34} {:<12} {:<9} Stage", "Session", "Result", "Attempts");
    println!("{:<34} {:<12} {:<9} -----", "-------", "------", "--------");

    for info in &sessions {
        let (result, attempts, stage) = match &info.summary {
            Some(summary) => (
                summary
                    .result
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "running".to_string()),
                summary.attempts.len().to_string(),
                summary
                    .successful_attempt()
                    .map(|a| a.stage.name.clone())
                    .unwrap_or_default(),
            ),
            None => ("incomplete".to_string(), "-".to_string(), String::new()),
        };
        println!("{:<34} {:<12} {:<9} {}", info.id, result, attempts, stage);
    }
    println!();
    Ok(())
}

/// Entries from the JSON Lines record, or the SQLite copy when that sink
/// was the only one written.
fn load_entries(dir: &Path) -> Result<Vec<LogEntry>> {
    let jsonl_path = dir.join(jsonl::FILE_NAME);
    if jsonl_path.exists() {
        return read_entries(&jsonl_path);
    }
    let sqlite_path = dir.join(sqlite::FILE_NAME);
    if sqlite_path.exists() {
        return sqlite::SqliteSink::open(&sqlite_path)?.entries();
    }
    bail!("No log records in {}", dir.display())
}

fn show_session(info: &SessionInfo, json: bool) -> Result<()> {
    let entries = load_entries(&info.dir)?;

    if json {
        let out = serde_json::json!({
            "id": info.id,
            "dir": info.dir,
            "summary": info.summary,
            "entries": entries,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{} {}", style("Session").bold(), info.id);
    if let Some(summary) = &info.summary {
        println!("Executable: {}", summary.executable.display());
        println!("Planned:    {}", summary.planned_stages.join(" -> "));
        if let Some(result) = summary.result {
            println!("Result:     {}", result);
        }
    }
    println!();
    for entry in &entries {
        println!("{}", text::format_line(entry));
    }
    println!();
    Ok(())
}
