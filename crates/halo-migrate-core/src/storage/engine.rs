//! Storage engine implementation.

use super::config::StorageConfig;
use super::key::{current_timestamp, render_key};
use super::lock::{ExclusiveGuard, TableLockManager};
use super::row::Row;
use crate::capture::{
    CaptureKind, ChangeCapture, ChangeLogEntry, ChangeOp, LogStreamCapture, StreamPump,
    TriggerCapture,
};
use crate::catalog::{CaptureBinding, Catalog, ConstraintDef, TableDef, TableStats, Value};
use crate::error::{map_tx_error, Error, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::{Db, Transactional, Tree};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prefix of row tree names.
const ROWS_PREFIX: &str = "rows:";

/// Prefix of unique index tree names.
const UNIQUE_INDEX_PREFIX: &str = "uidx:";

/// The host database: a catalog of tables over sled trees.
///
/// Cheap to clone; clones share the database, the locks and the running
/// change streams.
#[derive(Clone)]
pub struct StorageEngine {
    inner: Arc<Inner>,
}

struct Inner {
    db: Db,
    catalog: Catalog,
    locks: TableLockManager,
    /// Serializes writes per table name, so LSN order is commit order.
    write_mutexes: DashMap<String, Arc<Mutex<()>>>,
    /// Row operations committed per storage id since open.
    write_ops: DashMap<u64, Arc<AtomicU64>>,
    /// Running log-stream captures by migration id.
    streams: DashMap<String, StreamPump>,
    config: StorageConfig,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // stop pump threads before the database goes away
        self.streams.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Any,
    Absent,
    Present,
}

enum Mutation {
    Put {
        key: Vec<u8>,
        row: Row,
        bytes: Vec<u8>,
        expect: Expect,
    },
    Remove {
        key: Vec<u8>,
        expect: Expect,
    },
}

#[derive(Debug, Default)]
struct Outcome {
    row_ops: u64,
    removed: usize,
}

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<Error>>;

impl StorageEngine {
    /// Open or create a storage engine with the given configuration.
    pub fn open(config: StorageConfig) -> Result<Self> {
        let db = config.to_sled_config().open()?;
        let catalog = Catalog::open(&db)?;
        tracing::debug!(path = %config.path.display(), temporary = config.temporary, "opened host database");

        Ok(Self {
            inner: Arc::new(Inner {
                db,
                catalog,
                locks: TableLockManager::new(),
                write_mutexes: DashMap::new(),
                write_ops: DashMap::new(),
                streams: DashMap::new(),
                config,
            }),
        })
    }

    /// The underlying sled database.
    pub fn db(&self) -> &Db {
        &self.inner.db
    }

    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    pub fn locks(&self) -> &TableLockManager {
        &self.inner.locks
    }

    /// Check if the database was recovered from a previous crash.
    pub fn was_recovered(&self) -> bool {
        self.inner.db.was_recovered()
    }

    // ========== Tables ==========

    /// Create a table. Assigns its storage id and first version.
    pub fn create_table(&self, mut def: TableDef) -> Result<TableDef> {
        def.validate()?;
        def.storage_id = self.next_id()?;
        def.version = 1;
        def.indexes_ready = true;
        def.capture = None;
        def.stats = None;
        self.inner.catalog.insert_new(&def)?;
        tracing::info!(table = %def.name, storage_id = def.storage_id, "created table");
        Ok(def)
    }

    /// Current definition of a table.
    pub fn describe(&self, table: &str) -> Result<TableDef> {
        self.inner
            .catalog
            .get(table)?
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    pub fn list_tables(&self) -> Result<Vec<TableDef>> {
        self.inner.catalog.list()
    }

    /// Drop a table and its storage. Returns `false` if it did not exist.
    pub fn drop_table(&self, table: &str) -> Result<bool> {
        let mutex = self.write_mutex(table);
        let _serial = mutex.lock();

        let Some(def) = self.inner.catalog.get(table)? else {
            return Ok(false);
        };
        if let Some(binding) = &def.capture {
            return Err(Error::CaptureConflict {
                table: table.to_string(),
                migration_id: binding.migration_id.clone(),
            });
        }
        self.inner.catalog.remove(table)?;
        self.inner.db.drop_tree(rows_tree_name(def.storage_id))?;
        self.inner.db.drop_tree(unique_tree_name(def.storage_id))?;
        self.inner.write_ops.remove(&def.storage_id);
        tracing::info!(table, storage_id = def.storage_id, "dropped table");
        Ok(true)
    }

    // ========== Application DML ==========

    /// Insert a row whose primary key must not exist.
    pub fn insert(&self, table: &str, row: Row) -> Result<()> {
        self.app_write(table, |def| {
            let put = prepare_put(def, row, Expect::Absent)?;
            self.commit(def, &[put]).map(|_| ())
        })
    }

    /// Insert or replace a row.
    pub fn upsert(&self, table: &str, row: Row) -> Result<()> {
        self.app_write(table, |def| {
            let put = prepare_put(def, row, Expect::Any)?;
            self.commit(def, &[put]).map(|_| ())
        })
    }

    /// Replace the row with primary key `key`. The new row may carry a
    /// different primary key.
    pub fn update(&self, table: &str, key: &[Value], row: Row) -> Result<()> {
        self.app_write(table, |def| {
            let old_key = def.encode_key(key)?;
            let put = prepare_put(def, row, Expect::Present)?;
            let mutations = match put {
                Mutation::Put {
                    key: new_key,
                    row,
                    bytes,
                    ..
                } if new_key != old_key => vec![
                    Mutation::Remove {
                        key: old_key,
                        expect: Expect::Present,
                    },
                    Mutation::Put {
                        key: new_key,
                        row,
                        bytes,
                        expect: Expect::Absent,
                    },
                ],
                same_key => vec![same_key],
            };
            self.commit(def, &mutations).map(|_| ())
        })
    }

    /// Delete the row with primary key `key`. Returns whether it existed.
    pub fn delete(&self, table: &str, key: &[Value]) -> Result<bool> {
        self.app_write(table, |def| {
            let key = def.encode_key(key)?;
            let outcome = self.commit(
                def,
                &[Mutation::Remove {
                    key,
                    expect: Expect::Any,
                }],
            )?;
            Ok(outcome.removed > 0)
        })
    }

    pub fn get(&self, table: &str, key: &[Value]) -> Result<Option<Row>> {
        let def = self.describe(table)?;
        let key = def.encode_key(key)?;
        match self.rows_tree(def.storage_id)?.get(key)? {
            Some(bytes) => Ok(Some(Row::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All rows in primary key order.
    pub fn scan(&self, table: &str) -> Result<Vec<Row>> {
        let def = self.describe(table)?;
        let mut rows = Vec::new();
        for item in self.rows_tree(def.storage_id)?.iter() {
            let (_, value) = item?;
            rows.push(Row::from_bytes(&value)?);
        }
        Ok(rows)
    }

    pub fn count(&self, table: &str) -> Result<u64> {
        let def = self.describe(table)?;
        Ok(self.rows_tree(def.storage_id)?.len() as u64)
    }

    /// blake3 digest of a table's keys and rows, as hex.
    pub fn digest(&self, table: &str) -> Result<String> {
        let def = self.describe(table)?;
        let mut hasher = blake3::Hasher::new();
        for item in self.rows_tree(def.storage_id)?.iter() {
            let (key, value) = item?;
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(&key);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(&value);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.inner.db.flush()?;
        Ok(())
    }

    // ========== Migration operations ==========

    /// Take a table's exclusive lock, waiting at most `timeout`.
    pub fn lock_exclusive(&self, table: &str, timeout: Duration) -> Result<ExclusiveGuard> {
        self.inner.locks.exclusive(table, timeout)
    }

    /// Create a shadow table for `live` and bind `binding` to `live` in one
    /// catalog transaction. The shadow starts without unique indexes.
    pub fn create_shadow(
        &self,
        live: &str,
        expected_version: u64,
        mut shadow: TableDef,
        binding: Option<CaptureBinding>,
    ) -> Result<TableDef> {
        shadow.validate()?;
        shadow.storage_id = self.next_id()?;
        shadow.version = 1;
        shadow.indexes_ready = false;
        shadow.capture = None;
        shadow.stats = None;

        let mutex = self.write_mutex(live);
        let _serial = mutex.lock();
        self.inner
            .catalog
            .create_shadow(live, expected_version, &shadow, binding.as_ref())?;
        tracing::debug!(
            live,
            shadow = %shadow.name,
            storage_id = shadow.storage_id,
            bound = binding.is_some(),
            "created shadow table"
        );
        Ok(shadow)
    }

    /// Up to `limit` rows with a primary key greater than `after`.
    pub fn scan_batch(
        &self,
        table: &str,
        after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Row)>> {
        let def = self.describe(table)?;
        let tree = self.rows_tree(def.storage_id)?;
        let iter = match after {
            Some(key) => tree.range::<Vec<u8>, _>((Bound::Excluded(key.to_vec()), Bound::Unbounded)),
            None => tree.iter(),
        };
        let mut batch = Vec::with_capacity(limit.min(4096));
        for item in iter.take(limit) {
            let (key, value) = item?;
            batch.push((key.to_vec(), Row::from_bytes(&value)?));
        }
        Ok(batch)
    }

    pub fn contains_key(&self, table: &str, key: &[u8]) -> Result<bool> {
        let def = self.describe(table)?;
        Ok(self.rows_tree(def.storage_id)?.contains_key(key)?)
    }

    /// Insert or replace a row without taking the table lock.
    pub fn apply_upsert(&self, table: &str, row: Row) -> Result<()> {
        self.serialized(table, |def| {
            let put = prepare_put(def, row, Expect::Any)?;
            self.commit(def, &[put]).map(|_| ())
        })
    }

    /// Upsert a batch of rows in one transaction without taking the table
    /// lock.
    pub fn copy_rows(&self, table: &str, rows: Vec<Row>) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.serialized(table, |def| {
            let puts = rows
                .into_iter()
                .map(|row| prepare_put(def, row, Expect::Any))
                .collect::<Result<Vec<_>>>()?;
            Ok(self.commit(def, &puts)?.row_ops as usize)
        })
    }

    /// Delete by encoded key if present, without taking the table lock.
    pub fn apply_delete(&self, table: &str, key: &[u8]) -> Result<bool> {
        self.serialized(table, |def| {
            let outcome = self.commit(
                def,
                &[Mutation::Remove {
                    key: key.to_vec(),
                    expect: Expect::Any,
                }],
            )?;
            Ok(outcome.removed > 0)
        })
    }

    /// Clear a table's unique index entries and stop maintaining them.
    pub fn reset_unique_indexes(&self, table: &str) -> Result<()> {
        self.serialized(table, |def| {
            self.unique_tree(def.storage_id)?.clear()?;
            if def.indexes_ready {
                self.inner.catalog.update(table, None, |d| {
                    d.indexes_ready = false;
                    Ok(())
                })?;
            }
            Ok(())
        })
    }

    /// Build a table's unique indexes from its rows and maintain them from
    /// then on. Returns the number of index entries.
    pub fn build_unique_indexes(&self, table: &str) -> Result<usize> {
        self.serialized(table, |def| {
            let uidx = self.unique_tree(def.storage_id)?;
            uidx.clear()?;

            let mut entries = 0;
            for item in self.rows_tree(def.storage_id)?.iter() {
                let (key, value) = item?;
                let row = Row::from_bytes(&value)?;
                for constraint in &def.constraints {
                    let ConstraintDef::Unique { name, columns } = constraint else {
                        continue;
                    };
                    let Some(values) = def.unique_values(columns, &row) else {
                        continue;
                    };
                    let entry = unique_index_key(name, &values);
                    if let Some(owner) = uidx.get(&entry)? {
                        if *owner != *key {
                            uidx.clear()?;
                            return Err(Error::UniqueViolation {
                                table: def.name.clone(),
                                constraint: name.clone(),
                                value: render_values(&values),
                            });
                        }
                    }
                    uidx.insert(entry, key.clone())?;
                    entries += 1;
                }
            }

            self.inner.catalog.update(table, None, |d| {
                d.indexes_ready = true;
                Ok(())
            })?;
            tracing::debug!(table, entries, "built unique indexes");
            Ok(entries)
        })
    }

    /// Make `shadow` the table named `live`; the old live table is kept as
    /// `retired`.
    pub fn swap(&self, live: &str, shadow: &str, retired: &str) -> Result<TableDef> {
        let mutex = self.write_mutex(live);
        let _serial = mutex.lock();
        let promoted = self.inner.catalog.swap(live, shadow, retired)?;
        tracing::info!(live, retired, storage_id = promoted.storage_id, "swapped tables");
        Ok(promoted)
    }

    /// Replace the schema of `table` without rewriting rows.
    pub fn alter_in_place(
        &self,
        table: &str,
        expected_version: u64,
        target: &TableDef,
    ) -> Result<TableDef> {
        self.serialized(table, |current| {
            let mut candidate = current.clone();
            candidate.columns = target.columns.clone();
            candidate.primary_key = target.primary_key.clone();
            candidate.constraints = target.constraints.clone();
            candidate.validate()?;

            let updated = self.inner.catalog.update(table, Some(expected_version), |d| {
                d.columns = candidate.columns.clone();
                d.primary_key = candidate.primary_key.clone();
                d.constraints = candidate.constraints.clone();
                Ok(())
            })?;

            let uidx = self.unique_tree(current.storage_id)?;
            for constraint in &current.constraints {
                if let ConstraintDef::Unique { name, .. } = constraint {
                    if updated.constraint(name).is_none() {
                        let mut prefix = name.as_bytes().to_vec();
                        prefix.push(0);
                        for item in uidx.scan_prefix(&prefix) {
                            let (key, _) = item?;
                            uidx.remove(key)?;
                        }
                    }
                }
            }
            tracing::info!(table, version = updated.version, "altered table in place");
            Ok(updated)
        })
    }

    /// Refresh a table's statistics.
    pub fn analyze(&self, table: &str) -> Result<TableStats> {
        let def = self.describe(table)?;
        let stats = TableStats {
            row_count: self.rows_tree(def.storage_id)?.len() as u64,
            analyzed_at: current_timestamp(),
        };
        self.inner.catalog.update(table, None, |d| {
            d.stats = Some(stats);
            Ok(())
        })?;
        Ok(stats)
    }

    /// A change capture of the given kind over this database.
    pub fn change_capture(&self, kind: CaptureKind) -> Arc<dyn ChangeCapture> {
        match kind {
            CaptureKind::Trigger => Arc::new(TriggerCapture::new(self.clone())),
            CaptureKind::LogStream => Arc::new(LogStreamCapture::new(self.clone())),
        }
    }

    // ========== Internals shared with the captures ==========

    pub(crate) fn rows_tree(&self, storage_id: u64) -> Result<Tree> {
        Ok(self.inner.db.open_tree(rows_tree_name(storage_id))?)
    }

    fn unique_tree(&self, storage_id: u64) -> Result<Tree> {
        Ok(self.inner.db.open_tree(unique_tree_name(storage_id))?)
    }

    /// Mutex serializing writes to `table`.
    pub(crate) fn write_mutex(&self, table: &str) -> Arc<Mutex<()>> {
        if let Some(mutex) = self.inner.write_mutexes.get(table) {
            return Arc::clone(mutex.value());
        }
        Arc::clone(
            self.inner
                .write_mutexes
                .entry(table.to_string())
                .or_default()
                .value(),
        )
    }

    /// Counter of committed row operations on a storage id.
    pub(crate) fn write_counter(&self, storage_id: u64) -> Arc<AtomicU64> {
        Arc::clone(self.inner.write_ops.entry(storage_id).or_default().value())
    }

    pub(crate) fn streams(&self) -> &DashMap<String, StreamPump> {
        &self.inner.streams
    }

    /// Next LSN. Never 0, so 0 can mean "nothing applied yet".
    pub(crate) fn next_lsn(&self) -> Result<u64> {
        self.next_id()
    }

    fn next_id(&self) -> Result<u64> {
        Ok(self.inner.db.generate_id()? + 1)
    }

    fn app_write<T>(&self, table: &str, write: impl FnOnce(&TableDef) -> Result<T>) -> Result<T> {
        let _shared = self
            .inner
            .locks
            .shared(table, self.inner.config.write_lock_timeout)?;
        self.serialized(table, write)
    }

    fn serialized<T>(&self, table: &str, write: impl FnOnce(&TableDef) -> Result<T>) -> Result<T> {
        let mutex = self.write_mutex(table);
        let _serial = mutex.lock();
        let def = self.describe(table)?;
        write(&def)
    }

    /// Commit mutations to a table in one transaction, together with their
    /// change-log entries when a capture is bound.
    fn commit(&self, def: &TableDef, mutations: &[Mutation]) -> Result<Outcome> {
        let rows = self.rows_tree(def.storage_id)?;
        let uidx = self.unique_tree(def.storage_id)?;

        let outcome = match &def.capture {
            Some(binding) => {
                let log = self.inner.db.open_tree(&binding.log_tree)?;
                let lsns = mutations
                    .iter()
                    .map(|_| self.next_lsn())
                    .collect::<Result<Vec<_>>>()?;
                let committed_at = current_timestamp();
                (&rows, &uidx, &log)
                    .transaction(|(rows, uidx, log)| {
                        apply_mutations(def, mutations, rows, uidx, Some((log, lsns.as_slice(), committed_at)))
                    })
                    .map_err(map_tx_error)?
            }
            None => (&rows, &uidx)
                .transaction(|(rows, uidx)| apply_mutations(def, mutations, rows, uidx, None))
                .map_err(map_tx_error)?,
        };

        if outcome.row_ops > 0 {
            self.write_counter(def.storage_id)
                .fetch_add(outcome.row_ops, Ordering::SeqCst);
        }
        Ok(outcome)
    }
}

fn rows_tree_name(storage_id: u64) -> String {
    format!("{}{}", ROWS_PREFIX, storage_id)
}

fn unique_tree_name(storage_id: u64) -> String {
    format!("{}{}", UNIQUE_INDEX_PREFIX, storage_id)
}

fn prepare_put(def: &TableDef, row: Row, expect: Expect) -> Result<Mutation> {
    def.validate_row(&row)?;
    let key = def.key_of(&row)?;
    let bytes = row.to_bytes()?;
    Ok(Mutation::Put {
        key,
        row,
        bytes,
        expect,
    })
}

fn abort(err: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(err)
}

fn apply_mutations(
    def: &TableDef,
    mutations: &[Mutation],
    rows: &TransactionalTree,
    uidx: &TransactionalTree,
    log: Option<(&TransactionalTree, &[u64], u64)>,
) -> TxResult<Outcome> {
    let maintain_indexes = def.indexes_ready && def.has_unique_constraints();
    let mut outcome = Outcome::default();

    for (i, mutation) in mutations.iter().enumerate() {
        let op = match mutation {
            Mutation::Put {
                key,
                row,
                bytes,
                expect,
            } => {
                let old = rows.get(key)?;
                match (expect, &old) {
                    (Expect::Absent, Some(_)) => {
                        return Err(abort(Error::DuplicateKey {
                            table: def.name.clone(),
                            key: render_key(key),
                        }))
                    }
                    (Expect::Present, None) => {
                        return Err(abort(Error::RowNotFound {
                            table: def.name.clone(),
                        }))
                    }
                    _ => {}
                }
                if maintain_indexes {
                    let old_row = old
                        .map(|bytes| Row::from_bytes(&bytes))
                        .transpose()
                        .map_err(abort)?;
                    update_unique(def, uidx, key, old_row.as_ref(), Some(row))?;
                }
                rows.insert(key.as_slice(), bytes.as_slice())?;
                ChangeOp::Upsert {
                    key: key.clone(),
                    row: row.clone(),
                }
            }
            Mutation::Remove { key, expect } => {
                let Some(old) = rows.get(key)? else {
                    if *expect == Expect::Present {
                        return Err(abort(Error::RowNotFound {
                            table: def.name.clone(),
                        }));
                    }
                    continue;
                };
                if maintain_indexes {
                    let old_row = Row::from_bytes(&old).map_err(abort)?;
                    update_unique(def, uidx, key, Some(&old_row), None)?;
                }
                rows.remove(key.as_slice())?;
                outcome.removed += 1;
                ChangeOp::Delete { key: key.clone() }
            }
        };
        outcome.row_ops += 1;

        if let Some((log, lsns, committed_at)) = log {
            let entry = ChangeLogEntry {
                lsn: lsns[i],
                op,
                committed_at,
            };
            let bytes = entry.to_bytes().map_err(abort)?;
            log.insert(entry.lsn.to_be_bytes().to_vec(), bytes)?;
        }
    }
    Ok(outcome)
}

fn update_unique(
    def: &TableDef,
    uidx: &TransactionalTree,
    key: &[u8],
    old: Option<&Row>,
    new: Option<&Row>,
) -> TxResult<()> {
    for constraint in &def.constraints {
        let ConstraintDef::Unique { name, columns } = constraint else {
            continue;
        };
        let old_entry = old
            .and_then(|row| def.unique_values(columns, row))
            .map(|values| unique_index_key(name, &values));
        let new_values = new.and_then(|row| def.unique_values(columns, row));
        let new_entry = new_values
            .as_ref()
            .map(|values| unique_index_key(name, values));
        if old_entry == new_entry {
            continue;
        }

        if let Some(entry) = &old_entry {
            if uidx.get(entry)?.is_some_and(|owner| &*owner == key) {
                uidx.remove(entry.as_slice())?;
            }
        }
        if let (Some(entry), Some(values)) = (&new_entry, &new_values) {
            if let Some(owner) = uidx.get(entry)? {
                if &*owner != key {
                    return Err(abort(Error::UniqueViolation {
                        table: def.name.clone(),
                        constraint: name.clone(),
                        value: render_values(values),
                    }));
                }
            }
            uidx.insert(entry.as_slice(), key)?;
        }
    }
    Ok(())
}

/// Index entry key: constraint name, a zero byte, then the encoded values.
fn unique_index_key(constraint: &str, values: &[Value]) -> Vec<u8> {
    let mut key = constraint.as_bytes().to_vec();
    key.push(0);
    key.extend_from_slice(&super::key::encode_key(values));
    key
}

fn render_values(values: &[Value]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
