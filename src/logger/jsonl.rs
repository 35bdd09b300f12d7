//! Append-only JSON Lines sink (`logs.jsonl`).
//!
//! One entry per line. Each append takes an exclusive `flock` on the file so
//! records from separate processes never interleave, and is synced to disk
//! before returning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;

use super::{LogEntry, LogSink};

pub const FILE_NAME: &str = "logs.jsonl";

pub struct JsonlSink {
    path: PathBuf,
    file: File,
}

impl JsonlSink {
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

impl LogSink for JsonlSink {
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("Failed to serialize log entry")?;
        line.push(b'\n');

        self.file
            .lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.path.display()))?;
        let written = self
            .file
            .write_all(&line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data());
        let _ = FileExt::unlock(&self.file);

        written.with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}

/// Read every entry back from a JSONL file, in file order.
pub fn read_entries(path: &Path) -> Result<Vec<LogEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("Malformed entry at {}:{}", path.display(), idx + 1))
        })
        .collect()
}
