//! Typed error hierarchy for the launcher.
//!
//! Three enums cover the subsystems that can fail outright:
//! - `LockError` - single-instance lock acquisition
//! - `LoggerError` - opening the forensic record for a session
//! - `OrchestratorError` - everything that ends a launch session early
//!
//! Expected launch failures (a child crashing, a spawn error) are not errors;
//! they are `supervisor::Outcome` values and drive the fallback loop.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the single-instance lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another instance is already running (lock at {path}{})", holder_suffix(.holder_pid))]
    AlreadyRunning {
        path: PathBuf,
        holder_pid: Option<u32>,
    },

    #[error("Failed to open lock file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(", held by pid {}", pid),
        None => String::new(),
    }
}

/// Errors from opening a session's forensic record.
///
/// Individual sinks never surface errors once the logger is open; they are
/// disabled instead. Only a missing session directory is fatal.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Failed to create session directory at {path}: {source}")]
    SessionDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that end a launch session.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Another instance is already running (lock at {path})")]
    AlreadyRunning {
        path: PathBuf,
        holder_pid: Option<u32>,
    },

    #[error("Executable not found: {path}")]
    ExecutableNotFound { path: PathBuf },

    #[error("Launch interrupted during attempt {attempt}; session record at {session_dir}")]
    Interrupted { attempt: usize, session_dir: PathBuf },

    #[error("Lock error: {0}")]
    Lock(#[source] LockError),

    #[error("Failed to write session data at {path}: {source}")]
    Session {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Logger(#[from] LoggerError),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl From<LockError> for OrchestratorError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::AlreadyRunning { path, holder_pid } => {
                OrchestratorError::AlreadyRunning { path, holder_pid }
            }
            other => OrchestratorError::Lock(other),
        }
    }
}
