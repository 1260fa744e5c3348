//! Per-table locks with bounded waits.
//!
//! Application writes hold a table's shared lock for the duration of one
//! write. Migrations take the exclusive lock for shadow setup, in-place
//! alters and the cutover swap. A waiting exclusive request blocks new
//! shared requests, so a steady stream of writers cannot starve the cutover.

use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
    exclusive_waiters: usize,
}

/// Shared/exclusive lock of one table.
#[derive(Debug, Default)]
pub struct TableLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl TableLock {
    /// Acquire the shared lock, waiting at most `timeout`.
    pub fn try_shared(self: &Arc<Self>, timeout: Duration) -> Option<SharedGuard> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.exclusive || state.exclusive_waiters > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive || state.exclusive_waiters > 0)
            {
                return None;
            }
        }
        state.shared += 1;
        Some(SharedGuard {
            lock: Arc::clone(self),
        })
    }

    /// Acquire the exclusive lock, waiting at most `timeout`.
    pub fn try_exclusive(self: &Arc<Self>, timeout: Duration) -> Option<ExclusiveGuard> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.exclusive_waiters += 1;
        while state.exclusive || state.shared > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.exclusive || state.shared > 0)
            {
                state.exclusive_waiters -= 1;
                // readers queued behind this request may proceed
                self.cond.notify_all();
                return None;
            }
        }
        state.exclusive_waiters -= 1;
        state.exclusive = true;
        Some(ExclusiveGuard {
            lock: Arc::clone(self),
            acquired_at: Instant::now(),
        })
    }

    /// Number of current shared holders.
    pub fn shared_holders(&self) -> usize {
        self.state.lock().shared
    }

    pub fn is_exclusively_held(&self) -> bool {
        self.state.lock().exclusive
    }
}

/// Releases the shared lock on drop.
#[derive(Debug)]
pub struct SharedGuard {
    lock: Arc<TableLock>,
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.shared -= 1;
        if state.shared == 0 {
            self.lock.cond.notify_all();
        }
    }
}

/// Releases the exclusive lock on drop.
#[derive(Debug)]
pub struct ExclusiveGuard {
    lock: Arc<TableLock>,
    acquired_at: Instant,
}

impl ExclusiveGuard {
    /// How long the lock has been held.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        let mut state = self.lock.state.lock();
        state.exclusive = false;
        self.lock.cond.notify_all();
    }
}

/// Locks for all tables, keyed by table name.
#[derive(Debug, Default)]
pub struct TableLockManager {
    locks: DashMap<String, Arc<TableLock>>,
}

impl TableLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `table`, created on first use.
    pub fn lock_for(&self, table: &str) -> Arc<TableLock> {
        if let Some(lock) = self.locks.get(table) {
            return Arc::clone(lock.value());
        }
        Arc::clone(self.locks.entry(table.to_string()).or_default().value())
    }

    /// Shared lock or `Error::LockTimeout`.
    pub fn shared(&self, table: &str, timeout: Duration) -> Result<SharedGuard> {
        self.lock_for(table)
            .try_shared(timeout)
            .ok_or_else(|| Error::LockTimeout {
                table: table.to_string(),
                mode: "shared",
                waited_ms: timeout.as_millis() as u64,
            })
    }

    /// Exclusive lock or `Error::LockTimeout`.
    pub fn exclusive(&self, table: &str, timeout: Duration) -> Result<ExclusiveGuard> {
        self.lock_for(table)
            .try_exclusive(timeout)
            .ok_or_else(|| Error::LockTimeout {
                table: table.to_string(),
                mode: "exclusive",
                waited_ms: timeout.as_millis() as u64,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_shared_locks_coexist() {
        let locks = TableLockManager::new();
        let a = locks.shared("t", Duration::from_millis(10)).unwrap();
        let b = locks.shared("t", Duration::from_millis(10)).unwrap();
        assert_eq!(locks.lock_for("t").shared_holders(), 2);
        drop(a);
        drop(b);
        assert_eq!(locks.lock_for("t").shared_holders(), 0);
    }

    #[test]
    fn test_exclusive_times_out_behind_reader() {
        let locks = TableLockManager::new();
        let _reader = locks.shared("t", Duration::from_millis(10)).unwrap();

        let started = Instant::now();
        let err = locks.exclusive("t", Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { mode: "exclusive", .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));

        // the failed request no longer blocks readers
        assert!(locks.shared("t", Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_exclusive_blocks_readers_until_released() {
        let locks = Arc::new(TableLockManager::new());
        let guard = locks.exclusive("t", Duration::from_millis(10)).unwrap();
        assert!(locks.shared("t", Duration::from_millis(20)).is_err());

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.shared("t", Duration::from_secs(5)).is_ok())
        };
        thread::sleep(Duration::from_millis(30));
        drop(guard);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_waiting_writer_has_priority() {
        let locks = Arc::new(TableLockManager::new());
        let reader = locks.shared("t", Duration::from_millis(10)).unwrap();

        let writer = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || locks.exclusive("t", Duration::from_secs(5)).is_ok())
        };
        // wait for the writer to queue
        let deadline = Instant::now() + Duration::from_secs(5);
        while locks.lock_for("t").state.lock().exclusive_waiters == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(locks.shared("t", Duration::from_millis(20)).is_err());

        drop(reader);
        assert!(writer.join().unwrap());
    }

    #[test]
    fn test_locks_are_per_table() {
        let locks = TableLockManager::new();
        let _a = locks.exclusive("a", Duration::from_millis(10)).unwrap();
        assert!(locks.exclusive("b", Duration::from_millis(10)).is_ok());
    }
}
