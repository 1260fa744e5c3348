//! Shadow table synchronization.
//!
//! Copies the live table into the shadow in primary key order, then replays
//! the change log against the shadow until the backlog stays below the switch
//! threshold. Every batch ends with a state save, so a new process resumes at
//! the last saved cursor and LSN. Replaying an entry twice is harmless: upserts
//! carry the full row image and deletes of missing keys are no-ops.

use super::cancel::CancellationToken;
use super::config::SyncConfig;
use super::error::{MigrateError, Result};
use super::state::{CopyProgress, MigrationState, MigrationStateStore, Phase};
use crate::capture::{ChangeCapture, ChangeOp};
use crate::host::HostDatabase;
use std::time::{Duration, Instant};

/// How long catch-up waits for in-flight stream events.
const CATCH_UP_FLUSH: Duration = Duration::from_secs(5);

/// Copies rows and replays captured changes.
pub struct SyncEngine<'a> {
    host: &'a dyn HostDatabase,
    capture: &'a dyn ChangeCapture,
    store: &'a MigrationStateStore,
    config: &'a SyncConfig,
    cancel: &'a CancellationToken,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        host: &'a dyn HostDatabase,
        capture: &'a dyn ChangeCapture,
        store: &'a MigrationStateStore,
        config: &'a SyncConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            host,
            capture,
            store,
            config,
            cancel,
        }
    }

    /// Copy one batch after the saved cursor. Returns `false` once the live
    /// table is exhausted.
    pub fn copy_batch(&self, state: &mut MigrationState) -> Result<bool> {
        let shadow = state.shadow_ref()?.clone();
        let batch = self.host.scan_batch(
            state.table(),
            state.copy.last_key.as_deref(),
            self.config.batch_size,
        )?;
        let Some((last_key, _)) = batch.last() else {
            return Ok(false);
        };
        let last_key = last_key.clone();

        let rows = batch
            .iter()
            .map(|(_, row)| shadow.transform.apply(row))
            .collect::<Result<Vec<_>>>()?;
        let copied = self.host.copy_rows(&shadow.table, rows)?;

        state.copy.last_key = Some(last_key);
        state.copy.rows_copied += copied as u64;
        Ok(true)
    }

    /// Copy the whole live table, saving the cursor after every batch.
    pub fn copy(&self, state: &mut MigrationState) -> Result<()> {
        if state.copy.last_key.is_none() {
            state.copy.total_rows = self.host.row_count(state.table())?;
            tracing::info!(
                migration_id = %state.migration_id,
                rows = state.copy.total_rows,
                "copy started"
            );
        }
        loop {
            self.cancel.check()?;
            let more = self.copy_batch(state)?;
            self.store.save(state)?;
            if !more {
                break;
            }
            tracing::debug!(
                migration_id = %state.migration_id,
                copied = state.copy.rows_copied,
                percent = state.copy.percent_complete(),
                "copy batch"
            );
            if !self.config.batch_delay.is_zero() {
                std::thread::sleep(self.config.batch_delay);
            }
        }

        if state.copy.needs_prune {
            self.prune(state)?;
            state.copy.needs_prune = false;
            self.store.save(state)?;
        }
        tracing::info!(
            migration_id = %state.migration_id,
            rows = state.copy.rows_copied,
            "copy finished"
        );
        Ok(())
    }

    /// Delete shadow rows whose key is gone from the live table.
    fn prune(&self, state: &MigrationState) -> Result<u64> {
        let shadow = &state.shadow_ref()?.table;
        let mut after: Option<Vec<u8>> = None;
        let mut pruned = 0;
        loop {
            self.cancel.check()?;
            let batch = self
                .host
                .scan_batch(shadow, after.as_deref(), self.config.batch_size)?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            after = Some(last_key.clone());
            for (key, _) in &batch {
                if !self.host.contains_key(state.table(), key)? && self.host.apply_delete(shadow, key)? {
                    pruned += 1;
                }
            }
        }
        if pruned > 0 {
            tracing::info!(migration_id = %state.migration_id, pruned, "removed rows deleted during capture gap");
        }
        Ok(pruned)
    }

    /// Apply up to `apply_count` entries after the last applied LSN, then save
    /// and purge them. Returns how many were applied.
    pub fn apply_batch(&self, state: &mut MigrationState) -> Result<usize> {
        let handle = state.capture_handle()?.clone();
        let shadow = state.shadow_ref()?.clone();
        let entries = self
            .capture
            .peek(&handle, state.last_applied_lsn, self.config.apply_count)?;

        let mut applied = 0;
        for entry in entries {
            if entry.lsn <= state.last_applied_lsn {
                continue;
            }
            match &entry.op {
                ChangeOp::Upsert { row, .. } => {
                    self.host
                        .apply_upsert(&shadow.table, shadow.transform.apply(row)?)?;
                }
                ChangeOp::Delete { key } => {
                    self.host.apply_delete(&shadow.table, key)?;
                }
            }
            state.last_applied_lsn = entry.lsn;
            state.entries_applied += 1;
            applied += 1;
        }

        if applied > 0 {
            self.store.save(state)?;
            self.capture.purge(&handle, state.last_applied_lsn)?;
        }
        Ok(applied)
    }

    /// Apply everything currently in the log.
    pub fn drain(&self, state: &mut MigrationState) -> Result<u64> {
        let mut total = 0;
        loop {
            let applied = self.apply_batch(state)?;
            total += applied as u64;
            if applied < self.config.apply_count {
                return Ok(total);
            }
        }
    }

    /// Replay the log up to its current high water mark. Run after the copy,
    /// before unique indexes are built on the shadow. Stalls if writes the
    /// capture has seen do not reach the log in time.
    pub fn catch_up(&self, state: &mut MigrationState) -> Result<()> {
        let handle = state.capture_handle()?.clone();
        if !self.capture.flush(&handle, CATCH_UP_FLUSH)? {
            return Err(MigrateError::SyncStalled {
                backlog: self.capture.backlog(&handle, state.last_applied_lsn)?,
                waited_ms: CATCH_UP_FLUSH.as_millis() as u64,
            });
        }
        let target = self.capture.high_water(&handle)?;
        while state.last_applied_lsn < target {
            self.cancel.check()?;
            if self.apply_batch(state)? == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Replay until the backlog stays below the switch threshold for
    /// `converge_polls` consecutive polls.
    ///
    /// Fails with [`MigrateError::SyncStalled`] if that does not happen within
    /// the sync deadline of this run.
    pub fn converge(&self, state: &mut MigrationState) -> Result<()> {
        let handle = state.capture_handle()?.clone();
        let started = Instant::now();
        let mut converged = 0;
        loop {
            self.cancel.check()?;
            let applied = self.apply_batch(state)?;
            let backlog = self.capture.backlog(&handle, state.last_applied_lsn)?;

            if backlog < self.config.switch_threshold {
                converged += 1;
                if converged >= self.config.converge_polls {
                    tracing::info!(
                        migration_id = %state.migration_id,
                        backlog,
                        applied = state.entries_applied,
                        "shadow converged"
                    );
                    return Ok(());
                }
            } else {
                converged = 0;
            }

            let waited = started.elapsed();
            if waited >= self.config.deadline {
                return Err(MigrateError::SyncStalled {
                    backlog,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            if applied < self.config.apply_count {
                std::thread::sleep(self.config.poll_interval);
            }
        }
    }

    /// Start over after writes may have been missed.
    ///
    /// Entries logged before the gap (up to `stale_lsn`) are skipped: the
    /// re-copy reads newer row images than they carry. Rows the re-copy
    /// cannot see, deleted during the gap, are pruned afterwards.
    pub fn restart_after_gap(&self, state: &mut MigrationState, stale_lsn: u64) -> Result<()> {
        let handle = state.capture_handle()?.clone();
        let shadow = state.shadow_ref()?.table.clone();
        tracing::warn!(
            migration_id = %state.migration_id,
            phase = %state.phase,
            "change capture had a gap, copying the table again"
        );

        self.host.reset_unique_indexes(&shadow)?;
        state.last_applied_lsn = state.last_applied_lsn.max(stale_lsn);
        self.capture.purge(&handle, state.last_applied_lsn)?;
        state.copy = CopyProgress {
            needs_prune: true,
            ..CopyProgress::default()
        };
        if state.phase != Phase::Copying {
            state.transition(Phase::Copying)?;
        }
        self.store.checkpoint(state)
    }
}
