//! Session directory and attempt ledger.
//!
//! A session is one orchestrator run. Its directory is named after the start
//! time (`session_%Y-%m-%d_%H-%M-%S`, with `-2`, `-3`, ... appended if two
//! runs start within the same second) and holds the forensic logs, one output
//! capture per attempt, and `summary.json` written at teardown.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Local};
use serde::{Deserialize, Serialize};

use crate::stage::{EnvSnapshot, Stage};
use crate::supervisor::{LaunchReport, Outcome};

pub const SESSION_PREFIX: &str = "session_";
pub const SUMMARY_FILE: &str = "summary.json";
const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
/// Rendered length of [`STAMP_FORMAT`].
const STAMP_FORMAT_LEN: usize = "2025-01-01_00-00-00".len();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionResult {
    Success,
    Exhausted,
    Interrupted,
}

impl std::fmt::Display for SessionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionResult::Success => write!(f, "success"),
            SessionResult::Exhausted => write!(f, "exhausted"),
            SessionResult::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// One launch of one stage. Frozen once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, contiguous within a session.
    pub number: usize,
    pub stage: Stage,
    pub started_at: DateTime<FixedOffset>,
    pub ended_at: DateTime<FixedOffset>,
    pub pid: Option<u32>,
    pub outcome: Outcome,
    pub capture_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub dir: PathBuf,
    pub executable: PathBuf,
    pub started_at: DateTime<FixedOffset>,
    #[serde(default)]
    pub ended_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub snapshot: EnvSnapshot,
    /// Names of the stages planned for this session, in order.
    #[serde(default)]
    pub planned_stages: Vec<String>,
    #[serde(default)]
    pub attempts: Vec<Attempt>,
    #[serde(default)]
    pub result: Option<SessionResult>,
}

impl Session {
    /// Create a fresh session directory under `base_dir`.
    pub fn create(base_dir: &Path, executable: &Path, snapshot: &EnvSnapshot) -> io::Result<Self> {
        std::fs::create_dir_all(base_dir)?;

        let started_at = Local::now().fixed_offset();
        let stem = format!("{}{}", SESSION_PREFIX, started_at.format(STAMP_FORMAT));

        let mut suffix = 1;
        let (id, dir) = loop {
            let id = if suffix == 1 {
                stem.clone()
            } else {
                format!("{}-{}", stem, suffix)
            };
            let dir = base_dir.join(&id);
            match std::fs::create_dir(&dir) {
                Ok(()) => break (id, dir),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(err),
            }
        };

        Ok(Self {
            id,
            dir,
            executable: executable.to_path_buf(),
            started_at,
            ended_at: None,
            snapshot: snapshot.clone(),
            planned_stages: Vec::new(),
            attempts: Vec::new(),
            result: None,
        })
    }

    /// Where attempt `number` writes its stdout/stderr.
    pub fn capture_path(&self, number: usize) -> PathBuf {
        self.dir.join(format!("attempt-{}.out", number))
    }

    pub fn next_attempt_number(&self) -> usize {
        self.attempts.len() + 1
    }

    /// Append the attempt for `stage`, numbered after the last one.
    pub fn record(
        &mut self,
        stage: &Stage,
        started_at: DateTime<FixedOffset>,
        report: &LaunchReport,
    ) -> &Attempt {
        let number = self.next_attempt_number();
        self.attempts.push(Attempt {
            number,
            stage: stage.clone(),
            started_at,
            ended_at: Local::now().fixed_offset(),
            pid: report.pid,
            outcome: report.outcome.clone(),
            capture_path: self.capture_path(number),
        });
        &self.attempts[number - 1]
    }

    pub fn finish(&mut self, result: SessionResult) {
        self.result = Some(result);
        self.ended_at = Some(Local::now().fixed_offset());
    }

    /// The attempt that reached the stability window, if any.
    pub fn successful_attempt(&self) -> Option<&Attempt> {
        self.attempts.iter().find(|a| a.outcome.is_stable())
    }

    /// Write `summary.json` atomically (temp file, then rename).
    pub fn write_summary(&self) -> io::Result<PathBuf> {
        let path = self.dir.join(SUMMARY_FILE);
        let tmp = self.dir.join(format!("{}.tmp", SUMMARY_FILE));
        let json = serde_json::to_vec_pretty(self).map_err(io::Error::other)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    pub fn load_summary(dir: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let path = dir.join(SUMMARY_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Malformed {}", path.display()))
    }
}

/// A session directory found on disk.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub dir: PathBuf,
    /// `None` when the run is still going or was killed before teardown.
    pub summary: Option<Session>,
}

/// All session directories under `base_dir`, oldest first.
pub fn list_sessions(base_dir: &Path) -> io::Result<Vec<SessionInfo>> {
    let read_dir = match std::fs::read_dir(base_dir) {
        Ok(rd) => rd,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut sessions = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(SESSION_PREFIX) || !entry.file_type()?.is_dir() {
            continue;
        }
        let dir = entry.path();
        sessions.push(SessionInfo {
            summary: Session::load_summary(&dir).ok(),
            id: name,
            dir,
        });
    }
    sessions.sort_by(|a, b| sort_key(&a.id).cmp(&sort_key(&b.id)));
    Ok(sessions)
}

/// Timestamp stem and collision suffix (`1` when absent). Zero-padded
/// timestamps sort lexically; suffixes must sort numerically.
fn sort_key(id: &str) -> (&str, u32) {
    let stem_len = SESSION_PREFIX.len() + STAMP_FORMAT_LEN;
    if let (Some(stem), Some(rest)) = (id.get(..stem_len), id.get(stem_len..))
        && let Some(suffix) = rest.strip_prefix('-')
        && let Ok(n) = suffix.parse()
    {
        return (stem, n);
    }
    (id, 1)
}

pub fn latest_session(base_dir: &Path) -> io::Result<Option<SessionInfo>> {
    Ok(list_sessions(base_dir)?.pop())
}
