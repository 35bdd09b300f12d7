//! Multi-sink forensic logger for one session.
//!
//! Every [`ForensicLogger::write`] goes to three sinks inside the session
//! directory and is echoed to the console:
//!
//! | Sink     | File           | Purpose                          |
//! |----------|----------------|----------------------------------|
//! | `jsonl`  | `logs.jsonl`   | append-only, synced per entry    |
//! | `sqlite` | `logs.sqlite`  | queryable after the fact         |
//! | `text`   | `launcher.log` | human-readable                   |
//!
//! Writing never fails. A sink that cannot be opened, or that errors on a
//! write, is disabled for the rest of the session and exactly one `WARN`
//! entry naming it goes to the sinks that remain.
//!
//! The logger is `Send + Sync`; share it as `Arc<ForensicLogger>`. Each sink
//! has its own mutex, so one entry is never interleaved with another within
//! a sink.

pub mod jsonl;
pub mod sqlite;
pub mod text;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::bail;
use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::LoggerError;

pub use jsonl::read_entries;

const LOGGER_TARGET: &str = "chrome_troubleshooter::logger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
    Success,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Success => "SUCCESS",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Level {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(Level::Debug),
            "INFO" => Ok(Level::Info),
            "WARN" | "WARNING" => Ok(Level::Warn),
            "ERROR" => Ok(Level::Error),
            "SUCCESS" => Ok(Level::Success),
            other => bail!("Unknown log level '{}'", other),
        }
    }
}

/// One forensic record. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<FixedOffset>,
    pub level: Level,
    pub source: String,
    #[serde(alias = "content")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub session_id: String,
}

impl LogEntry {
    /// Stamp a new entry with the current local time.
    pub fn new(
        session_id: &str,
        source: &str,
        level: Level,
        message: &str,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            ts: Local::now().fixed_offset(),
            level,
            source: source.to_string(),
            message: message.to_string(),
            metadata,
            session_id: session_id.to_string(),
        }
    }
}

/// A durable destination for entries.
pub trait LogSink: Send {
    fn append(&mut self, entry: &LogEntry) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub enable_json: bool,
    pub enable_sqlite: bool,
    /// Echo every entry to stdout.
    pub echo: bool,
    pub color: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            enable_json: true,
            enable_sqlite: true,
            echo: true,
            color: true,
        }
    }
}

impl LoggerOptions {
    /// All durable sinks on, console quiet.
    pub fn quiet() -> Self {
        Self {
            echo: false,
            color: false,
            ..Self::default()
        }
    }
}

struct SinkSlot {
    name: &'static str,
    path: PathBuf,
    enabled: bool,
    sink: Mutex<Option<Box<dyn LogSink>>>,
}

impl SinkSlot {
    fn is_active(&self) -> bool {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

struct SinkFailure {
    sink: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SinkStatus {
    pub name: String,
    pub path: PathBuf,
    /// Requested by configuration.
    pub enabled: bool,
    /// Still accepting writes.
    pub active: bool,
    pub size_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoggerStats {
    pub session_id: String,
    pub session_dir: PathBuf,
    pub entries: u64,
    pub colors_enabled: bool,
    pub sinks: Vec<SinkStatus>,
}

pub struct ForensicLogger {
    session_id: String,
    dir: PathBuf,
    options: LoggerOptions,
    slots: Vec<SinkSlot>,
    entries: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ForensicLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForensicLogger")
            .field("session_id", &self.session_id)
            .field("dir", &self.dir)
            .field("entries", &self.entries.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ForensicLogger {
    /// Open the logger for a session directory, creating it if needed.
    ///
    /// Only a session directory that cannot be created is an error; sinks
    /// that fail to open are disabled and reported through the others.
    pub fn open(
        dir: &Path,
        session_id: &str,
        options: LoggerOptions,
    ) -> Result<Self, LoggerError> {
        std::fs::create_dir_all(dir).map_err(|source| LoggerError::SessionDir {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut failures = Vec::new();
        let mut slots = Vec::new();

        let jsonl_path = dir.join(jsonl::FILE_NAME);
        slots.push(open_slot(
            "jsonl",
            jsonl_path.clone(),
            options.enable_json,
            || jsonl::JsonlSink::open(&jsonl_path).map(|s| Box::new(s) as Box<dyn LogSink>),
            &mut failures,
        ));

        let sqlite_path = dir.join(sqlite::FILE_NAME);
        slots.push(open_slot(
            "sqlite",
            sqlite_path.clone(),
            options.enable_sqlite,
            || sqlite::SqliteSink::open(&sqlite_path).map(|s| Box::new(s) as Box<dyn LogSink>),
            &mut failures,
        ));

        let text_path = dir.join(text::FILE_NAME);
        slots.push(open_slot(
            "text",
            text_path.clone(),
            true,
            || text::TextSink::open(&text_path).map(|s| Box::new(s) as Box<dyn LogSink>),
            &mut failures,
        ));

        let logger = Self {
            session_id: session_id.to_string(),
            dir: dir.to_path_buf(),
            options,
            slots,
            entries: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        };

        for failure in failures {
            let entry = logger.degradation_entry(&failure);
            logger.emit(entry);
        }

        Ok(logger)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record one entry in every active sink and echo it.
    ///
    /// Returns once the JSONL record is on disk. Never fails.
    ///
    /// This blocks the calling thread on file locks, `fsync` and the SQLite
    /// insert. Occasional calls from async code are fine; a task writing in
    /// a loop should hand each write to `tokio::task::spawn_blocking`.
    pub fn write(
        &self,
        source: &str,
        level: Level,
        message: &str,
        metadata: Option<Value>,
    ) -> LogEntry {
        let entry = LogEntry::new(&self.session_id, source, level, message, metadata);
        self.emit(entry.clone());
        entry
    }

    pub fn debug(&self, source: &str, message: &str) -> LogEntry {
        self.write(source, Level::Debug, message, None)
    }

    pub fn info(&self, source: &str, message: &str) -> LogEntry {
        self.write(source, Level::Info, message, None)
    }

    pub fn warn(&self, source: &str, message: &str) -> LogEntry {
        self.write(source, Level::Warn, message, None)
    }

    pub fn error(&self, source: &str, message: &str) -> LogEntry {
        self.write(source, Level::Error, message, None)
    }

    pub fn success(&self, source: &str, message: &str) -> LogEntry {
        self.write(source, Level::Success, message, None)
    }

    /// Number of entries written so far, including degradation warnings.
    pub fn entry_count(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }

    /// Names of sinks that are enabled but no longer accepting writes.
    pub fn degraded_sinks(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .filter(|slot| slot.enabled && !slot.is_active())
            .map(|slot| slot.name)
            .collect()
    }

    pub fn stats(&self) -> LoggerStats {
        LoggerStats {
            session_id: self.session_id.clone(),
            session_dir: self.dir.clone(),
            entries: self.entry_count(),
            colors_enabled: self.options.color,
            sinks: self
                .slots
                .iter()
                .map(|slot| SinkStatus {
                    name: slot.name.to_string(),
                    path: slot.path.clone(),
                    enabled: slot.enabled,
                    active: slot.is_active(),
                    size_bytes: std::fs::metadata(&slot.path).ok().map(|m| m.len()),
                })
                .collect(),
        }
    }

    /// Write the session-end entries. Only the first call has any effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.info(
            "logger",
            &format!("Session ended: {}", Local::now().to_rfc3339()),
        );
        let total = self.entry_count() + 1;
        self.write(
            "logger",
            Level::Info,
            &format!("Total log entries: {}", total),
            Some(serde_json::json!({ "total_entries": total })),
        );
    }

    /// Dispatch an entry, then any warnings its failures produced.
    fn emit(&self, entry: LogEntry) {
        let mut pending = vec![entry];
        while let Some(entry) = pending.pop() {
            for failure in self.dispatch(&entry) {
                pending.push(self.degradation_entry(&failure));
            }
        }
    }

    fn dispatch(&self, entry: &LogEntry) -> Vec<SinkFailure> {
        let mut failures = Vec::new();

        for slot in &self.slots {
            let mut guard = slot.sink.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(sink) = guard.as_mut() else {
                continue;
            };
            if let Err(error) = sink.append(entry) {
                *guard = None;
                failures.push(SinkFailure {
                    sink: slot.name,
                    error: format!("{:#}", error),
                });
            }
        }

        self.entries.fetch_add(1, Ordering::SeqCst);

        if self.options.echo {
            text::echo(entry, self.options.color);
        }

        failures
    }

    fn degradation_entry(&self, failure: &SinkFailure) -> LogEntry {
        warn!(target: LOGGER_TARGET, sink = failure.sink, error = %failure.error, "log sink disabled");
        LogEntry::new(
            &self.session_id,
            "logger",
            Level::Warn,
            &format!(
                "{} sink disabled for this session: {}",
                failure.sink, failure.error
            ),
            Some(serde_json::json!({ "sink": failure.sink, "error": failure.error })),
        )
    }
}

fn open_slot<F>(
    name: &'static str,
    path: PathBuf,
    enabled: bool,
    open: F,
    failures: &mut Vec<SinkFailure>,
) -> SinkSlot
where
    F: FnOnce() -> anyhow::Result<Box<dyn LogSink>>,
{
    let sink = if enabled {
        match open() {
            Ok(sink) => Some(sink),
            Err(error) => {
                failures.push(SinkFailure {
                    sink: name,
                    error: format!("{:#}", error),
                });
                None
            }
        }
    } else {
        None
    };

    SinkSlot {
        name,
        path,
        enabled,
        sink: Mutex::new(sink),
    }
}
