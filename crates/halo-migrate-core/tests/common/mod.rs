//! Shared fixtures for the migration integration tests.

#![allow(dead_code)]

use halo_migrate_core::capture::ChangeLogEntry;
use halo_migrate_core::catalog::{CaptureBinding, ColumnDef, ColumnType, TableDef, TableStats, Value};
use halo_migrate_core::error::{Error, Result};
use halo_migrate_core::migration::{CutoverConfig, MigrationConfig, SyncConfig};
use halo_migrate_core::storage::{ExclusiveGuard, Row, StorageConfig, StorageEngine};
use halo_migrate_core::{CaptureHandle, CaptureKind, ChangeCapture, HostDatabase};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ACCOUNTS: &str = "accounts";

/// `accounts(id int primary key, email text)`.
pub fn accounts_def() -> TableDef {
    TableDef::new(
        ACCOUNTS,
        vec![
            ColumnDef::new("id", ColumnType::Int).not_null(),
            ColumnDef::new("email", ColumnType::Text),
        ],
        vec!["id"],
    )
}

pub fn account(id: i64, email: &str) -> Row {
    Row::new(vec![Value::Int(id), Value::Text(email.to_string())])
}

pub fn temp_engine() -> StorageEngine {
    StorageEngine::open(StorageConfig::temporary()).unwrap()
}

/// Create `accounts` with ids `0..rows`.
pub fn seed_accounts(engine: &StorageEngine, rows: i64) {
    engine.create_table(accounts_def()).unwrap();
    for id in 0..rows {
        engine
            .insert(ACCOUNTS, account(id, &format!("user{}@example.com", id)))
            .unwrap();
    }
}

/// Settings that keep the tests fast.
pub fn fast_config() -> MigrationConfig {
    MigrationConfig::default()
        .with_sync(
            SyncConfig::default()
                .with_batch_size(500)
                .with_batch_delay(Duration::ZERO)
                .with_poll_interval(Duration::from_millis(5))
                .with_converge_polls(1)
                .with_deadline(Duration::from_secs(30)),
        )
        .with_cutover(
            CutoverConfig::default()
                .with_lock_timeout(Duration::from_secs(5))
                .with_flush_timeout(Duration::from_secs(2)),
        )
}

/// Failures injected by [`FaultyHost`].
#[derive(Debug)]
pub struct Faults {
    pub fail_swap: AtomicBool,
    /// Successful `copy_rows` calls left before they start failing.
    pub copies_left: AtomicUsize,
    /// Delay added to every applied change-log entry, in milliseconds.
    pub apply_delay_ms: AtomicU64,
    /// Capture flushes time out.
    pub stuck_flush: AtomicBool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            fail_swap: AtomicBool::new(false),
            copies_left: AtomicUsize::new(usize::MAX),
            apply_delay_ms: AtomicU64::new(0),
            stuck_flush: AtomicBool::new(false),
        }
    }
}

/// Host that forwards to a [`StorageEngine`] and fails on request.
#[derive(Clone)]
pub struct FaultyHost {
    pub engine: StorageEngine,
    pub faults: Arc<Faults>,
}

impl FaultyHost {
    pub fn new(engine: StorageEngine) -> Self {
        Self {
            engine,
            faults: Arc::new(Faults::default()),
        }
    }

    fn apply_delay(&self) {
        let ms = self.faults.apply_delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

impl HostDatabase for FaultyHost {
    fn describe(&self, table: &str) -> Result<TableDef> {
        self.engine.describe(table)
    }

    fn lock_exclusive(&self, table: &str, timeout: Duration) -> Result<ExclusiveGuard> {
        self.engine.lock_exclusive(table, timeout)
    }

    fn create_shadow(
        &self,
        live: &str,
        expected_version: u64,
        shadow: TableDef,
        binding: Option<CaptureBinding>,
    ) -> Result<TableDef> {
        self.engine.create_shadow(live, expected_version, shadow, binding)
    }

    fn drop_table(&self, table: &str) -> Result<bool> {
        self.engine.drop_table(table)
    }

    fn scan_batch(&self, table: &str, after: Option<&[u8]>, limit: usize) -> Result<Vec<(Vec<u8>, Row)>> {
        self.engine.scan_batch(table, after, limit)
    }

    fn contains_key(&self, table: &str, key: &[u8]) -> Result<bool> {
        self.engine.contains_key(table, key)
    }

    fn copy_rows(&self, table: &str, rows: Vec<Row>) -> Result<usize> {
        let allowed = self
            .faults
            .copies_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(Error::CatalogConflict("injected copy failure".to_string()));
        }
        self.engine.copy_rows(table, rows)
    }

    fn apply_upsert(&self, table: &str, row: Row) -> Result<()> {
        self.apply_delay();
        self.engine.apply_upsert(table, row)
    }

    fn apply_delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        self.apply_delay();
        self.engine.apply_delete(table, key)
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        self.engine.count(table)
    }

    fn reset_unique_indexes(&self, table: &str) -> Result<()> {
        self.engine.reset_unique_indexes(table)
    }

    fn build_unique_indexes(&self, table: &str) -> Result<usize> {
        self.engine.build_unique_indexes(table)
    }

    fn swap(&self, live: &str, shadow: &str, retired: &str) -> Result<TableDef> {
        if self.faults.fail_swap.load(Ordering::SeqCst) {
            return Err(Error::CatalogConflict("injected swap failure".to_string()));
        }
        self.engine.swap(live, shadow, retired)
    }

    fn alter_in_place(&self, table: &str, expected_version: u64, target: &TableDef) -> Result<TableDef> {
        self.engine.alter_in_place(table, expected_version, target)
    }

    fn analyze(&self, table: &str) -> Result<TableStats> {
        self.engine.analyze(table)
    }

    fn change_capture(&self, kind: CaptureKind) -> Arc<dyn ChangeCapture> {
        Arc::new(FaultyCapture {
            inner: self.engine.change_capture(kind),
            faults: Arc::clone(&self.faults),
        })
    }

    fn flush(&self) -> Result<()> {
        self.engine.flush()
    }
}

/// Capture that forwards to the engine's and fails on request.
struct FaultyCapture {
    inner: Arc<dyn ChangeCapture>,
    faults: Arc<Faults>,
}

impl ChangeCapture for FaultyCapture {
    fn kind(&self) -> CaptureKind {
        self.inner.kind()
    }

    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }

    fn install(&self, table: &TableDef, migration_id: &str) -> Result<CaptureHandle> {
        self.inner.install(table, migration_id)
    }

    fn attach(&self, handle: &CaptureHandle) -> Result<bool> {
        self.inner.attach(handle)
    }

    fn peek(&self, handle: &CaptureHandle, after: u64, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        self.inner.peek(handle, after, limit)
    }

    fn purge(&self, handle: &CaptureHandle, up_to: u64) -> Result<usize> {
        self.inner.purge(handle, up_to)
    }

    fn backlog(&self, handle: &CaptureHandle, after: u64) -> Result<u64> {
        self.inner.backlog(handle, after)
    }

    fn flush(&self, handle: &CaptureHandle, timeout: Duration) -> Result<bool> {
        if self.faults.stuck_flush.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.flush(handle, timeout)
    }

    fn high_water(&self, handle: &CaptureHandle) -> Result<u64> {
        self.inner.high_water(handle)
    }

    fn uninstall(&self, handle: &CaptureHandle) -> Result<()> {
        self.inner.uninstall(handle)
    }
}
