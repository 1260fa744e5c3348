//! Change capture through a catalog binding.
//!
//! While a [`CaptureBinding`](crate::catalog::CaptureBinding) is present on a
//! table, the storage engine appends a log entry for every row write inside
//! the write's own transaction.

use super::changelog::{log_tree_name, ChangeLog, ChangeLogEntry};
use super::{CaptureHandle, CaptureKind, ChangeCapture};
use crate::catalog::TableDef;
use crate::error::{Error, Result};
use crate::storage::StorageEngine;
use std::time::Duration;

/// Durable capture written with the captured rows.
pub struct TriggerCapture {
    engine: StorageEngine,
}

impl TriggerCapture {
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    fn log(&self, handle: &CaptureHandle) -> Result<ChangeLog> {
        ChangeLog::open(self.engine.db(), &handle.log_tree)
    }
}

impl ChangeCapture for TriggerCapture {
    fn kind(&self) -> CaptureKind {
        CaptureKind::Trigger
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn install(&self, table: &TableDef, migration_id: &str) -> Result<CaptureHandle> {
        if let Some(existing) = &table.capture {
            return Err(Error::CaptureConflict {
                table: table.name.clone(),
                migration_id: existing.migration_id.clone(),
            });
        }
        let handle = CaptureHandle {
            kind: CaptureKind::Trigger,
            migration_id: migration_id.to_string(),
            table: table.name.clone(),
            storage_id: table.storage_id,
            log_tree: log_tree_name(migration_id),
        };
        // creates the tree, so a restart before the first write still finds it
        self.log(&handle)?;
        Ok(handle)
    }

    fn attach(&self, handle: &CaptureHandle) -> Result<bool> {
        let live = self.engine.describe(&handle.table)?;
        if live.storage_id != handle.storage_id {
            // already swapped, nothing left to capture
            return Ok(true);
        }
        match &live.capture {
            Some(binding) if binding.migration_id == handle.migration_id => Ok(true),
            _ => Err(Error::CaptureInactive(handle.migration_id.clone())),
        }
    }

    fn peek(&self, handle: &CaptureHandle, after: u64, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        self.log(handle)?.peek(after, limit)
    }

    fn purge(&self, handle: &CaptureHandle, up_to: u64) -> Result<usize> {
        self.log(handle)?.purge(up_to)
    }

    fn backlog(&self, handle: &CaptureHandle, after: u64) -> Result<u64> {
        self.log(handle)?.backlog(after)
    }

    fn flush(&self, _handle: &CaptureHandle, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    fn high_water(&self, handle: &CaptureHandle) -> Result<u64> {
        self.log(handle)?.high_water()
    }

    fn uninstall(&self, handle: &CaptureHandle) -> Result<()> {
        let mutex = self.engine.write_mutex(&handle.table);
        {
            let _serial = mutex.lock();
            let bound = self
                .engine
                .catalog()
                .get(&handle.table)?
                .and_then(|def| def.capture)
                .is_some_and(|binding| binding.migration_id == handle.migration_id);
            if bound {
                self.engine.catalog().update(&handle.table, None, |def| {
                    def.capture = None;
                    Ok(())
                })?;
            }
        }
        self.engine.db().drop_tree(&handle.log_tree)?;
        tracing::debug!(migration_id = %handle.migration_id, table = %handle.table, "uninstalled trigger capture");
        Ok(())
    }
}
