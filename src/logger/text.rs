//! Human-readable output: the `launcher.log` sink and the console echo.
//!
//! Both use the same line format, `[ts][LEVEL][source] message`. Only the
//! console gets colour.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::{Term, style};
use fs2::FileExt;

use super::{Level, LogEntry, LogSink};

pub const FILE_NAME: &str = "launcher.log";

/// Format an entry as a single text line (no trailing newline).
pub fn format_line(entry: &LogEntry) -> String {
    format!(
        "[{}][{}][{}] {}",
        entry.ts.format("%Y-%m-%d %H:%M:%S"),
        entry.level.as_str(),
        entry.source,
        entry.message
    )
}

/// Print an entry to stdout. Console failures are ignored.
pub fn echo(entry: &LogEntry, color: bool) {
    let line = format_line(entry);
    let line = if color {
        let styled = match entry.level {
            Level::Error => style(line).red(),
            Level::Warn => style(line).yellow(),
            Level::Success => style(line).green(),
            Level::Info => style(line).cyan(),
            Level::Debug => style(line).magenta(),
        };
        styled.to_string()
    } else {
        line
    };
    let _ = Term::stdout().write_line(&line);
}

pub struct TextSink {
    path: PathBuf,
    file: File,
}

impl TextSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl LogSink for TextSink {
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let mut line = format_line(entry);
        line.push('\n');

        self.file
            .lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.path.display()))?;
        let written = self
            .file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.flush());
        let _ = FileExt::unlock(&self.file);

        written.with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use tempfile::TempDir;

    #[test]
    fn test_format_line() {
        let entry = LogEntry {
            ts: DateTime::parse_from_rfc3339("2025-03-04T05:06:07+02:00").unwrap(),
            level: Level::Warn,
            source: "launcher".to_string(),
            message: "attempt 2 failed".to_string(),
            metadata: None,
            session_id: "s".to_string(),
        };
        assert_eq!(
            format_line(&entry),
            "[2025-03-04 05:06:07][WARN][launcher] attempt 2 failed"
        );
    }

    #[test]
    fn test_sink_appends_plain_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(FILE_NAME);
        let mut sink = TextSink::open(&path).unwrap();

        sink.append(&LogEntry::new("s", "launcher", Level::Success, "stable", None))
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.ends_with("[SUCCESS][launcher] stable\n"));
        assert!(!content.contains('\u{1b}'), "File output must not carry ANSI codes");
    }
}
