//! Queryable SQLite sink (`logs.sqlite`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use rusqlite::{Connection, params};

use super::{Level, LogEntry, LogSink};

pub const FILE_NAME: &str = "logs.sqlite";

pub struct SqliteSink {
    path: PathBuf,
    conn: Connection,
}

impl SqliteSink {
    /// Open (or create) the database and make sure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let sink = Self {
            path: path.to_path_buf(),
            conn,
        };
        sink.init()?;
        Ok(sink)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;
        self.conn
            .pragma_update(None, "synchronous", "NORMAL")
            .context("Failed to set synchronous mode")?;
        self.conn
            .busy_timeout(Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    ts TEXT NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    content TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    metadata TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_logs_ts ON logs(ts);
                CREATE INDEX IF NOT EXISTS idx_logs_source ON logs(source);
                CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
                CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
                ",
            )
            .context("Failed to create logs table")?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
            .context("Failed to count log rows")?;
        Ok(n as u64)
    }

    pub fn count_by_level(&self, level: Level) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE level = ?1",
                params![level.as_str()],
                |row| row.get(0),
            )
            .context("Failed to count log rows by level")?;
        Ok(n as u64)
    }

    /// Every row, oldest first.
    pub fn entries(&self) -> Result<Vec<LogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ts, level, source, content, session_id, metadata FROM logs ORDER BY id",
            )
            .context("Failed to prepare log query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .context("Failed to query logs")?;

        let mut entries = Vec::new();
        for row in rows {
            let (ts, level, source, message, session_id, metadata) =
                row.context("Failed to read log row")?;
            entries.push(LogEntry {
                ts: DateTime::parse_from_rfc3339(&ts)
                    .with_context(|| format!("Bad timestamp in logs table: {}", ts))?,
                level: level.parse()?,
                source,
                message,
                metadata: metadata
                    .map(|m| serde_json::from_str(&m))
                    .transpose()
                    .context("Bad metadata in logs table")?,
                session_id,
            });
        }
        Ok(entries)
    }
}

impl LogSink for SqliteSink {
    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize metadata")?;

        self.conn
            .execute(
                "INSERT INTO logs (ts, level, source, content, session_id, metadata) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.ts.to_rfc3339(),
                    entry.level.as_str(),
                    entry.source,
                    entry.message,
                    entry.session_id,
                    metadata,
                ],
            )
            .with_context(|| format!("Failed to insert into {}", self.path.display()))?;
        Ok(())
    }
}
