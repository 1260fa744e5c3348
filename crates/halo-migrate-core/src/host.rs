//! The host database capability the migration engine runs against.

use crate::capture::{CaptureKind, ChangeCapture};
use crate::catalog::{CaptureBinding, TableDef, TableStats};
use crate::error::Result;
use crate::storage::{ExclusiveGuard, Row, StorageEngine};
use std::sync::Arc;
use std::time::Duration;

/// Transactional table store with catalog-level swaps and change capture.
///
/// Rows are addressed by their encoded primary key. Operations on shadow and
/// retired tables never take the table lock; the migration owns them.
pub trait HostDatabase: Send + Sync {
    /// Current definition of a table.
    fn describe(&self, table: &str) -> Result<TableDef>;

    /// Take the exclusive lock of `table`, waiting at most `timeout`.
    fn lock_exclusive(&self, table: &str, timeout: Duration) -> Result<ExclusiveGuard>;

    /// Create `shadow` and bind `binding` to `live` atomically. Fails if
    /// `live` is no longer at `expected_version`.
    fn create_shadow(
        &self,
        live: &str,
        expected_version: u64,
        shadow: TableDef,
        binding: Option<CaptureBinding>,
    ) -> Result<TableDef>;

    /// Drop a table. Returns `false` if it did not exist.
    fn drop_table(&self, table: &str) -> Result<bool>;

    /// Up to `limit` rows after primary key `after`, in key order.
    fn scan_batch(&self, table: &str, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Row)>>;

    fn contains_key(&self, table: &str, key: &[u8]) -> Result<bool>;

    /// Upsert rows in one transaction.
    fn copy_rows(&self, table: &str, rows: Vec<Row>) -> Result<usize>;

    fn apply_upsert(&self, table: &str, row: Row) -> Result<()>;

    /// Delete by primary key if present.
    fn apply_delete(&self, table: &str, key: &[u8]) -> Result<bool>;

    fn row_count(&self, table: &str) -> Result<u64>;

    fn reset_unique_indexes(&self, table: &str) -> Result<()>;

    fn build_unique_indexes(&self, table: &str) -> Result<usize>;

    /// Rename `live` to `retired` and `shadow` to `live` in one transaction.
    fn swap(&self, live: &str, shadow: &str, retired: &str) -> Result<TableDef>;

    /// Metadata-only schema change.
    fn alter_in_place(&self, table: &str, expected_version: u64, target: &TableDef) -> Result<TableDef>;

    fn analyze(&self, table: &str) -> Result<TableStats>;

    fn change_capture(&self, kind: CaptureKind) -> Arc<dyn ChangeCapture>;

    /// Persist everything written so far.
    fn flush(&self) -> Result<()>;
}

impl HostDatabase for StorageEngine {
    fn describe(&self, table: &str) -> Result<TableDef> {
        StorageEngine::describe(self, table)
    }

    fn lock_exclusive(&self, table: &str, timeout: Duration) -> Result<ExclusiveGuard> {
        StorageEngine::lock_exclusive(self, table, timeout)
    }

    fn create_shadow(
        &self,
        live: &str,
        expected_version: u64,
        shadow: TableDef,
        binding: Option<CaptureBinding>,
    ) -> Result<TableDef> {
        StorageEngine::create_shadow(self, live, expected_version, shadow, binding)
    }

    fn drop_table(&self, table: &str) -> Result<bool> {
        StorageEngine::drop_table(self, table)
    }

    fn scan_batch(&self, table: &str, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Row)>> {
        StorageEngine::scan_batch(self, table, after, limit)
    }

    fn contains_key(&self, table: &str, key: &[u8]) -> Result<bool> {
        StorageEngine::contains_key(self, table, key)
    }

    fn copy_rows(&self, table: &str, rows: Vec<Row>) -> Result<usize> {
        StorageEngine::copy_rows(self, table, rows)
    }

    fn apply_upsert(&self, table: &str, row: Row) -> Result<()> {
        StorageEngine::apply_upsert(self, table, row)
    }

    fn apply_delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        StorageEngine::apply_delete(self, table, key)
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        self.count(table)
    }

    fn reset_unique_indexes(&self, table: &str) -> Result<()> {
        StorageEngine::reset_unique_indexes(self, table)
    }

    fn build_unique_indexes(&self, table: &str) -> Result<usize> {
        StorageEngine::build_unique_indexes(self, table)
    }

    fn swap(&self, live: &str, shadow: &str, retired: &str) -> Result<TableDef> {
        StorageEngine::swap(self, live, shadow, retired)
    }

    fn alter_in_place(&self, table: &str, expected_version: u64, target: &TableDef) -> Result<TableDef> {
        StorageEngine::alter_in_place(self, table, expected_version, target)
    }

    fn analyze(&self, table: &str) -> Result<TableStats> {
        StorageEngine::analyze(self, table)
    }

    fn change_capture(&self, kind: CaptureKind) -> Arc<dyn ChangeCapture> {
        StorageEngine::change_capture(self, kind)
    }

    fn flush(&self) -> Result<()> {
        StorageEngine::flush(self)
    }
}
