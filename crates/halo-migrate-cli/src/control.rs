//! Control requests for a migration running in another process.
//!
//! A running `start` or `resume` holds the database directory, so `pause`
//! and `abort` cannot open it. They leave a `<id>.control` file in the
//! directory instead, which the runner polls between batches and removes
//! once it has acted on it.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often a running migration looks for a request.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    Pause,
    Abort,
}

impl ControlRequest {
    fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "pause" => Some(ControlRequest::Pause),
            "abort" => Some(ControlRequest::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for ControlRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlRequest::Pause => write!(f, "pause"),
            ControlRequest::Abort => write!(f, "abort"),
        }
    }
}

pub fn control_path(data_dir: &Path, migration_id: &str) -> PathBuf {
    data_dir.join(format!("{}.control", migration_id))
}

/// Leave `request` for the process running `migration_id`. A pending abort
/// is not downgraded to a pause.
pub fn request(data_dir: &Path, migration_id: &str, request: ControlRequest) -> io::Result<PathBuf> {
    let path = control_path(data_dir, migration_id);
    if request == ControlRequest::Pause && read(&path)? == Some(ControlRequest::Abort) {
        return Ok(path);
    }
    // written aside and renamed, so a poll never sees a partial file
    let staged = data_dir.join(format!("{}.control.tmp", migration_id));
    fs::write(&staged, request.to_string())?;
    fs::rename(&staged, &path)?;
    Ok(path)
}

/// Remove and return the pending request for `migration_id`.
pub fn take(data_dir: &Path, migration_id: &str) -> io::Result<Option<ControlRequest>> {
    let path = control_path(data_dir, migration_id);
    let request = read(&path)?;
    remove(&path)?;
    Ok(request)
}

/// Drop a request left over from an earlier run.
pub fn clear(data_dir: &Path, migration_id: &str) -> io::Result<()> {
    remove(&control_path(data_dir, migration_id))
}

fn read(path: &Path) -> io::Result<Option<ControlRequest>> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let request = ControlRequest::parse(&text);
            if request.is_none() {
                tracing::warn!(path = %path.display(), "ignoring unreadable control request");
            }
            Ok(request)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

fn remove(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
