//! Environment inspection (`stages` and `probe`).

use anyhow::{Context, Result};
use console::style;
use std::path::Path;

use chrome_troubleshooter::config::AppConfig;
use chrome_troubleshooter::stage::{self, EnvSnapshot};

/// Load a snapshot from `path`, or probe the running host.
pub async fn resolve_snapshot(path: Option<&Path>) -> Result<EnvSnapshot> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read snapshot file: {}", path.display()))?;
            EnvSnapshot::from_json(&content)
                .with_context(|| format!("Failed to parse snapshot file: {}", path.display()))
        }
        None => Ok(EnvSnapshot::detect().await),
    }
}

pub async fn cmd_stages(config: &AppConfig, snapshot: Option<&Path>, json: bool) -> Result<()> {
    let snapshot = resolve_snapshot(snapshot).await?;
    let all = stage::select(&snapshot);
    let planned = config.launch.max_attempts.min(all.len());

    if json {
        let out = serde_json::json!({
            "snapshot": snapshot,
            "max_attempts": config.launch.max_attempts,
            "stages": &all[..planned],
            "skipped": &all[planned..],
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("Stage plan (max_attempts = {})", config.launch.max_attempts);
    println!("==============================");
    println!();
    println!("{:<4} {:<18} Flags", "#", "Stage");
    println!("{:<4} {:<18} -----", "--", "-----");

    for (i, stage) in all.iter().enumerate() {
        let flags = if stage.flags.is_empty() {
            "(none)".to_string()
        } else {
            stage.flags.join(" ")
        };
        let line = format!("{:<4} {:<18} {}", i + 1, stage.name, flags);
        if i < planned {
            println!("{}", line);
        } else {
            println!("{}  {}", style(line).dim(), style("(beyond max_attempts)").dim());
        }
    }
    println!();
    Ok(())
}

pub async fn cmd_probe() -> Result<()> {
    let snapshot = EnvSnapshot::detect().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
