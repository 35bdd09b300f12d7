//! Per-attempt output capture.
//!
//! The child's stdout and stderr both go to one file in the session
//! directory. A file never fills up the way a pipe does, so a child that
//! outlives the stability window keeps running unimpeded after handoff.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::process::Stdio;

pub const TRUNCATION_MARKER: &str = "[... output truncated ...]\n";

/// Create (or truncate) the capture file and return stdio handles for
/// stdout and stderr that both append to it.
pub fn open(path: &Path) -> io::Result<(Stdio, Stdio)> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// Read at most `limit` bytes from the end of the capture file.
///
/// When the file is longer, the returned text starts with
/// [`TRUNCATION_MARKER`]. A missing file reads as empty.
pub fn read_tail(path: &Path, limit: usize) -> io::Result<String> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err),
    };
    let len = file.metadata()?.len();
    let limit = limit as u64;

    let mut out = String::new();
    if len > limit {
        file.seek(SeekFrom::Start(len - limit))?;
        out.push_str(TRUNCATION_MARKER);
    }

    let mut buf = Vec::with_capacity(len.min(limit) as usize);
    file.take(limit).read_to_end(&mut buf)?;
    out.push_str(&String::from_utf8_lossy(&buf));
    Ok(out)
}
