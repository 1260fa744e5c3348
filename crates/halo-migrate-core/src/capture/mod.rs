//! Change capture on live tables.
//!
//! A capture records every committed write to a live table after it is
//! installed, as an LSN-ordered change log the sync engine replays against
//! the shadow table. Two implementations exist:
//!
//! - [`TriggerCapture`] writes the log entry in the same transaction as the
//!   row. Nothing is lost across restarts.
//! - [`LogStreamCapture`] tails the table's change stream from a background
//!   thread. Events in flight are lost when the process stops, so after a
//!   restart the caller must re-scan the table.

mod changelog;
mod stream;
mod trigger;

pub use changelog::{log_tree_name, ChangeLog, ChangeLogEntry, ChangeOp};
pub use stream::LogStreamCapture;
pub(crate) use stream::StreamPump;
pub use trigger::TriggerCapture;

use crate::catalog::{CaptureBinding, TableDef};
use crate::error::Result;
use rkyv::{Archive, Deserialize, Serialize};
use std::time::Duration;

/// Capture mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum CaptureKind {
    Trigger,
    LogStream,
}

impl std::fmt::Display for CaptureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureKind::Trigger => write!(f, "trigger"),
            CaptureKind::LogStream => write!(f, "stream"),
        }
    }
}

impl std::str::FromStr for CaptureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trigger" => Ok(CaptureKind::Trigger),
            "stream" | "log-stream" | "logstream" => Ok(CaptureKind::LogStream),
            other => Err(format!("unknown capture kind: {}", other)),
        }
    }
}

/// Identifies an installed capture. Persisted with the migration state.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct CaptureHandle {
    pub kind: CaptureKind,
    pub migration_id: String,
    /// Live table being captured.
    pub table: String,
    /// Storage of the live table at install time.
    pub storage_id: u64,
    pub log_tree: String,
}

impl CaptureHandle {
    /// Catalog binding to install together with the shadow table, if the
    /// capture works through the catalog.
    pub fn binding(&self) -> Option<CaptureBinding> {
        match self.kind {
            CaptureKind::Trigger => Some(CaptureBinding {
                migration_id: self.migration_id.clone(),
                log_tree: self.log_tree.clone(),
            }),
            CaptureKind::LogStream => None,
        }
    }
}

/// A change capture mechanism of the host database.
pub trait ChangeCapture: Send + Sync {
    fn kind(&self) -> CaptureKind;

    /// Whether captured entries survive a process restart.
    fn is_durable(&self) -> bool;

    /// Prepare capture of `table` for `migration_id`.
    ///
    /// Must be called while the table's exclusive lock is held. Catalog-bound
    /// captures only become active once [`CaptureHandle::binding`] is
    /// committed with the shadow table.
    fn install(&self, table: &TableDef, migration_id: &str) -> Result<CaptureHandle>;

    /// Reattach to an installed capture after a restart.
    ///
    /// Returns `false` when writes may have been missed since the last
    /// attach; the caller must then re-scan the live table.
    fn attach(&self, handle: &CaptureHandle) -> Result<bool>;

    /// Up to `limit` entries after `after`, in LSN order.
    fn peek(&self, handle: &CaptureHandle, after: u64, limit: usize) -> Result<Vec<ChangeLogEntry>>;

    /// Drop entries up to and including `up_to`.
    fn purge(&self, handle: &CaptureHandle, up_to: u64) -> Result<usize>;

    /// Entries after `after` still to be applied, including ones not yet
    /// persisted to the log.
    fn backlog(&self, handle: &CaptureHandle, after: u64) -> Result<u64>;

    /// Wait until every committed write is in the log. Returns `false` if
    /// `timeout` elapsed first.
    fn flush(&self, handle: &CaptureHandle, timeout: Duration) -> Result<bool>;

    /// Highest LSN logged so far.
    fn high_water(&self, handle: &CaptureHandle) -> Result<u64>;

    /// Stop capturing and delete the log. Idempotent.
    fn uninstall(&self, handle: &CaptureHandle) -> Result<()>;
}
