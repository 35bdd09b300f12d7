//! Single-instance lock.
//!
//! The lock is an advisory `flock` on a well-known path. The kernel drops it
//! when the holding process exits for any reason, so a crashed launcher never
//! leaves a stale lock behind. The file body (`{pid, acquired_at}`) is only
//! informational and is never used to decide who holds the lock.
//!
//! The lock file itself is never deleted: removing it while another process
//! waits on the old inode would let two holders coexist.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::LockError;

const LOCK_TARGET: &str = "chrome_troubleshooter::lock";

/// Informational content written into the lock file by the holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Hands out the single-instance lock for one path.
#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
}

impl LockManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without blocking.
    ///
    /// Returns `LockError::AlreadyRunning` immediately when another handle,
    /// in this or any other process, holds it. Callers must not retry.
    pub fn acquire(&self) -> Result<LockHandle, LockError> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                let holder_pid = self.holder().map(|info| info.pid);
                debug!(target: LOCK_TARGET, file = %self.path.display(), ?holder_pid, "lock is held");
                return Err(LockError::AlreadyRunning {
                    path: self.path.clone(),
                    holder_pid,
                });
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        }

        let info = LockInfo {
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        if let Err(error) = write_info(&mut file, &info) {
            // The flock is what matters; the body is best effort.
            warn!(target: LOCK_TARGET, file = %self.path.display(), %error, "failed to record lock holder");
        }
        info!(target: LOCK_TARGET, pid = info.pid, file = %self.path.display(), "lock acquired");

        Ok(LockHandle {
            file: Some(file),
            path: self.path.clone(),
            info,
        })
    }

    /// Read the informational holder record, if the file has one.
    pub fn holder(&self) -> Option<LockInfo> {
        let content = std::fs::read_to_string(&self.path).ok()?;
        serde_json::from_str(content.trim()).ok()
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_info(file: &mut File, info: &LockInfo) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut *file, info)?;
    file.write_all(b"\n")?;
    file.sync_data()
}

/// Proof of holding the lock. Released on `release()` or drop.
#[derive(Debug)]
pub struct LockHandle {
    file: Option<File>,
    path: PathBuf,
    info: LockInfo,
}

impl LockHandle {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock. Calling this more than once is a no-op.
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        // Clear the holder record while still holding the lock so a reader
        // never sees a stale pid attributed to a free lock.
        if let Err(error) = file.set_len(0) {
            debug!(target: LOCK_TARGET, file = %self.path.display(), %error, "failed to clear lock file");
        }
        if let Err(error) = FileExt::unlock(&file) {
            warn!(target: LOCK_TARGET, file = %self.path.display(), %error, "failed to unlock");
        }
        info!(target: LOCK_TARGET, pid = self.info.pid, file = %self.path.display(), "lock released");
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path().join("ct.lock"))
    }

    #[test]
    fn test_acquire_writes_holder_info() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let handle = locks.acquire().unwrap();
        assert!(handle.is_held());
        assert_eq!(handle.info().pid, std::process::id());

        let holder = locks.holder().expect("holder info should be readable");
        assert_eq!(holder, *handle.info());
    }

    #[test]
    fn test_second_acquire_is_already_running() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let _held = locks.acquire().unwrap();
        match locks.acquire() {
            Err(LockError::AlreadyRunning { path, holder_pid }) => {
                assert_eq!(path, locks.path());
                assert_eq!(holder_pid, Some(std::process::id()));
            }
            other => panic!("Expected AlreadyRunning, got {:?}", other),
        }
    }

    #[test]
    fn test_release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let mut handle = locks.acquire().unwrap();
        handle.release();
        assert!(!handle.is_held());

        let again = locks.acquire();
        assert!(again.is_ok(), "Lock should be free after release");
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let mut handle = locks.acquire().unwrap();
        handle.release();
        handle.release();
        drop(handle);

        assert!(locks.acquire().is_ok());
    }

    #[test]
    fn test_drop_releases() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        {
            let _handle = locks.acquire().unwrap();
            assert!(locks.acquire().is_err());
        }

        assert!(locks.acquire().is_ok());
    }

    #[test]
    fn test_release_keeps_file_and_clears_holder() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let mut handle = locks.acquire().unwrap();
        handle.release();

        assert!(locks.path().exists(), "Lock file must never be deleted");
        assert!(locks.holder().is_none());
    }

    #[test]
    fn test_stale_content_does_not_block() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        std::fs::write(
            locks.path(),
            r#"{"pid":999999,"acquired_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let handle = locks.acquire().unwrap();
        assert_eq!(locks.holder().unwrap().pid, handle.info().pid);
    }

    #[test]
    fn test_unopenable_path_is_io_error() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("missing").join("ct.lock"));

        assert!(matches!(locks.acquire(), Err(LockError::Io { .. })));
    }

    #[test]
    fn test_contention_across_threads() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let locks = locks.clone();
                    scope.spawn(move || locks.acquire().ok())
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            results.iter().filter(|r| r.is_some()).count()
        });

        // Winning handles stay alive inside `results`, so nobody else can win.
        assert_eq!(winners, 1);
    }
}
