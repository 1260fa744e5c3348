//! Change capture by tailing a table's change stream.
//!
//! A pump thread subscribes to the live table's row tree and appends one log
//! entry per event. Progress of the pump is measured against the engine's
//! per-table write counter: every committed row operation produces exactly
//! one event.

use super::changelog::{log_tree_name, ChangeLog, ChangeLogEntry, ChangeOp};
use super::{CaptureHandle, CaptureKind, ChangeCapture};
use crate::catalog::TableDef;
use crate::error::{Error, Result};
use crate::storage::key::current_timestamp;
use crate::storage::{Row, StorageEngine};
use sled::{Db, Event, Subscriber};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the pump waits for an event before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Running pump of one migration.
pub(crate) struct StreamPump {
    storage_id: u64,
    /// Write counter of the table when the subscription started.
    baseline: u64,
    received: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamPump {
    /// Subscribe to `table` and start pumping into `log`.
    ///
    /// The caller holds the table's write mutex, so the baseline matches the
    /// subscription point exactly.
    fn start(engine: &StorageEngine, table: &TableDef, migration_id: &str, log: ChangeLog) -> Result<Self> {
        let subscriber = engine.rows_tree(table.storage_id)?.watch_prefix(Vec::new());
        let baseline = engine.write_counter(table.storage_id).load(Ordering::SeqCst);

        let received = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let db = engine.db().clone();
            let received = Arc::clone(&received);
            let running = Arc::clone(&running);
            let stop = Arc::clone(&stop);
            let migration_id = migration_id.to_string();
            std::thread::Builder::new()
                .name(format!("capture-{}", migration_id))
                .spawn(move || {
                    pump(subscriber, &db, &log, &received, &stop, &migration_id);
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(|e| Error::Storage(sled::Error::Io(e)))?
        };

        tracing::debug!(migration_id, table = %table.name, baseline, "started change stream");
        Ok(Self {
            storage_id: table.storage_id,
            baseline,
            received,
            running,
            stop,
            thread: Some(thread),
        })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Committed writes not yet in the log.
    fn pending(&self, committed: u64) -> u64 {
        committed
            .saturating_sub(self.baseline)
            .saturating_sub(self.received.load(Ordering::SeqCst))
    }
}

impl Drop for StreamPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn pump(
    mut subscriber: Subscriber,
    db: &Db,
    log: &ChangeLog,
    received: &AtomicU64,
    stop: &AtomicBool,
    migration_id: &str,
) {
    while !stop.load(Ordering::SeqCst) {
        let event = match subscriber.next_timeout(POLL_INTERVAL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if let Err(e) = record(db, log, event) {
            tracing::error!(migration_id, error = %e, "change stream failed");
            return;
        }
        received.fetch_add(1, Ordering::SeqCst);
    }
}

fn record(db: &Db, log: &ChangeLog, event: Event) -> Result<()> {
    let op = match event {
        Event::Insert { key, value } => ChangeOp::Upsert {
            key: key.to_vec(),
            row: Row::from_bytes(&value)?,
        },
        Event::Remove { key } => ChangeOp::Delete { key: key.to_vec() },
    };
    log.append(&ChangeLogEntry {
        lsn: db.generate_id()? + 1,
        op,
        committed_at: current_timestamp(),
    })
}

/// Volatile capture fed by the host's change stream.
pub struct LogStreamCapture {
    engine: StorageEngine,
}

impl LogStreamCapture {
    pub fn new(engine: StorageEngine) -> Self {
        Self { engine }
    }

    fn log(&self, handle: &CaptureHandle) -> Result<ChangeLog> {
        ChangeLog::open(self.engine.db(), &handle.log_tree)
    }

    fn start_pump(&self, table: &TableDef, migration_id: &str, log_tree: &str) -> Result<()> {
        let mutex = self.engine.write_mutex(&table.name);
        let _serial = mutex.lock();
        let log = ChangeLog::open(self.engine.db(), log_tree)?;
        let pump = StreamPump::start(&self.engine, table, migration_id, log)?;
        self.engine.streams().insert(migration_id.to_string(), pump);
        Ok(())
    }

    fn pending(&self, handle: &CaptureHandle) -> Result<u64> {
        let pump = self
            .engine
            .streams()
            .get(&handle.migration_id)
            .filter(|pump| pump.is_running())
            .ok_or_else(|| Error::CaptureInactive(handle.migration_id.clone()))?;
        let committed = self
            .engine
            .write_counter(pump.storage_id)
            .load(Ordering::SeqCst);
        Ok(pump.pending(committed))
    }
}

impl ChangeCapture for LogStreamCapture {
    fn kind(&self) -> CaptureKind {
        CaptureKind::LogStream
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn install(&self, table: &TableDef, migration_id: &str) -> Result<CaptureHandle> {
        if let Some(existing) = &table.capture {
            return Err(Error::CaptureConflict {
                table: table.name.clone(),
                migration_id: existing.migration_id.clone(),
            });
        }
        if let Some(other) = self
            .engine
            .streams()
            .iter()
            .find(|pump| pump.storage_id == table.storage_id && pump.key() != migration_id)
        {
            return Err(Error::CaptureConflict {
                table: table.name.clone(),
                migration_id: other.key().clone(),
            });
        }

        let handle = CaptureHandle {
            kind: CaptureKind::LogStream,
            migration_id: migration_id.to_string(),
            table: table.name.clone(),
            storage_id: table.storage_id,
            log_tree: log_tree_name(migration_id),
        };
        self.start_pump(table, migration_id, &handle.log_tree)?;
        Ok(handle)
    }

    fn attach(&self, handle: &CaptureHandle) -> Result<bool> {
        let running = self
            .engine
            .streams()
            .get(&handle.migration_id)
            .is_some_and(|pump| pump.is_running());
        if running {
            return Ok(true);
        }
        self.engine.streams().remove(&handle.migration_id);

        let live = self.engine.describe(&handle.table)?;
        if live.storage_id != handle.storage_id {
            return Ok(true);
        }
        self.start_pump(&live, &handle.migration_id, &handle.log_tree)?;
        tracing::warn!(
            migration_id = %handle.migration_id,
            table = %handle.table,
            "change stream restarted, writes since the last attach may be missing"
        );
        Ok(false)
    }

    fn peek(&self, handle: &CaptureHandle, after: u64, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        self.log(handle)?.peek(after, limit)
    }

    fn purge(&self, handle: &CaptureHandle, up_to: u64) -> Result<usize> {
        self.log(handle)?.purge(up_to)
    }

    fn backlog(&self, handle: &CaptureHandle, after: u64) -> Result<u64> {
        let logged = self.log(handle)?.backlog(after)?;
        Ok(logged + self.pending(handle)?)
    }

    fn flush(&self, handle: &CaptureHandle, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.pending(handle)? == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn high_water(&self, handle: &CaptureHandle) -> Result<u64> {
        self.log(handle)?.high_water()
    }

    fn uninstall(&self, handle: &CaptureHandle) -> Result<()> {
        // dropping the pump joins its thread
        self.engine.streams().remove(&handle.migration_id);
        self.engine.db().drop_tree(&handle.log_tree)?;
        tracing::debug!(migration_id = %handle.migration_id, "uninstalled change stream");
        Ok(())
    }
}
