//! Cutover coordination.
//!
//! ```text
//! Preparing -> LockAcquired -> Swapped -> Cleanup -> Done
//!      \            \
//!       +------------+--> Aborted (back to Syncing, live table unchanged)
//! ```
//!
//! The exclusive lock on the live table is held from `LockAcquired` until the
//! swap commits. Application writes wait on it; nothing else does. Each state
//! is saved before the work of the next one starts, so a crash leaves a state
//! a new process can resolve.

use super::cancel::CancellationToken;
use super::config::CutoverConfig;
use super::delta::{apply_delta, same_schema};
use super::error::{MigrateError, Result};
use super::shadow::retired_table_name;
use super::spec::Strategy;
use super::state::{CutoverState, MigrationState, MigrationStateStore, Phase};
use super::sync::SyncEngine;
use crate::capture::ChangeCapture;
use crate::error::Error;
use crate::host::HostDatabase;
use crate::storage::ExclusiveGuard;
use std::time::Instant;

/// Drives the cutover of one migration.
pub struct CutoverCoordinator<'a> {
    host: &'a dyn HostDatabase,
    store: &'a MigrationStateStore,
    config: &'a CutoverConfig,
    cancel: &'a CancellationToken,
}

impl<'a> CutoverCoordinator<'a> {
    pub fn new(
        host: &'a dyn HostDatabase,
        store: &'a MigrationStateStore,
        config: &'a CutoverConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            host,
            store,
            config,
            cancel,
        }
    }

    /// Take the exclusive lock of `table`, retrying with growing waits until
    /// the lock timeout is used up.
    ///
    /// Between attempts the lock is free, so queued application writes get
    /// through.
    pub fn acquire(&self, table: &str) -> Result<ExclusiveGuard> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            self.cancel.check()?;
            attempt += 1;
            let remaining = self.config.lock_timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(MigrateError::CutoverTimeout(format!(
                    "could not lock {} within {}ms ({} attempts)",
                    table,
                    started.elapsed().as_millis(),
                    attempt - 1
                )));
            }
            let wait = CutoverConfig::attempt_wait(attempt).min(remaining);
            match self.host.lock_exclusive(table, wait) {
                Ok(guard) => {
                    tracing::debug!(table, attempt, "cutover lock acquired");
                    return Ok(guard);
                }
                Err(Error::LockTimeout { waited_ms, .. }) => {
                    tracing::debug!(table, attempt, waited_ms, "cutover lock busy, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// From `Preparing`: lock, drain the remaining backlog and swap the
    /// shadow into place. Leaves the migration in `Swapped`, or back in
    /// `Syncing` with a [`MigrateError::CutoverTimeout`].
    pub fn lock_and_swap(
        &self,
        state: &mut MigrationState,
        sync: &SyncEngine<'_>,
        capture: &dyn ChangeCapture,
    ) -> Result<()> {
        let table = state.table().to_string();
        state.cutover_attempts += 1;

        let guard = match self.acquire(&table) {
            Ok(guard) => guard,
            Err(MigrateError::CutoverTimeout(reason)) => {
                return self.give_up(state, reason);
            }
            Err(e) => return Err(e),
        };

        state.transition(Phase::Cutover(CutoverState::LockAcquired))?;
        self.store.checkpoint(state)?;

        match self.drain_and_swap(state, sync, capture) {
            Ok(()) => {
                drop(guard);
                Ok(())
            }
            Err(err) => {
                drop(guard);
                match err {
                    MigrateError::CutoverTimeout(reason) => self.give_up(state, reason),
                    other => {
                        // still before the swap: the live table is authoritative
                        self.back_to_syncing(state)?;
                        Err(other)
                    }
                }
            }
        }
    }

    fn drain_and_swap(
        &self,
        state: &mut MigrationState,
        sync: &SyncEngine<'_>,
        capture: &dyn ChangeCapture,
    ) -> Result<()> {
        let handle = state.capture_handle()?.clone();
        let mut drained = false;
        for attempt in 1..=self.config.drain_retries {
            sync.drain(state)?;
            if !capture.flush(&handle, self.config.flush_timeout)? {
                tracing::warn!(migration_id = %state.migration_id, attempt, "capture flush timed out under lock");
                continue;
            }
            sync.drain(state)?;
            if capture.backlog(&handle, state.last_applied_lsn)? == 0 {
                drained = true;
                break;
            }
        }
        if !drained {
            return Err(MigrateError::CutoverTimeout(format!(
                "change log not drained after {} attempts",
                self.config.drain_retries
            )));
        }

        let shadow = state.shadow_ref()?.table.clone();
        let retired = retired_table_name(state.table(), &state.migration_id);
        self.host.swap(state.table(), &shadow, &retired)?;
        state.retired_table = Some(retired);
        state.transition(Phase::Cutover(CutoverState::Swapped))?;
        self.store.checkpoint(state)
    }

    /// Record an aborted cutover and return to syncing.
    fn give_up(&self, state: &mut MigrationState, reason: String) -> Result<()> {
        tracing::warn!(
            migration_id = %state.migration_id,
            attempts = state.cutover_attempts,
            reason = %reason,
            "cutover aborted, live table unchanged"
        );
        self.back_to_syncing(state)?;
        Err(MigrateError::CutoverTimeout(reason))
    }

    fn back_to_syncing(&self, state: &mut MigrationState) -> Result<()> {
        state.transition(Phase::Cutover(CutoverState::Aborted))?;
        state.transition(Phase::Syncing)?;
        self.store.checkpoint(state)
    }

    /// Resolve a `LockAcquired` record left by a crash: the swap either
    /// committed or it did not.
    pub fn resolve_lock_acquired(&self, state: &mut MigrationState) -> Result<()> {
        let live = self.host.describe(state.table())?;
        let committed = match state.spec.strategy {
            Strategy::Copy => live.storage_id == state.shadow_ref()?.storage_id,
            Strategy::InPlace => same_schema(&live, &state.target),
        };
        if committed {
            tracing::info!(migration_id = %state.migration_id, "swap committed before restart");
            if state.spec.strategy == Strategy::Copy {
                state.retired_table = Some(retired_table_name(state.table(), &state.migration_id));
            }
            state.transition(Phase::Cutover(CutoverState::Swapped))?;
        } else {
            state.transition(Phase::Cutover(CutoverState::Preparing))?;
        }
        self.store.checkpoint(state)
    }

    /// Metadata-only change under the exclusive lock. From `Preparing` to
    /// `Swapped`; a lock timeout leaves the migration in `Preparing`, a
    /// failed change puts it back there.
    pub fn alter_in_place(&self, state: &mut MigrationState) -> Result<()> {
        let table = state.table().to_string();
        state.cutover_attempts += 1;
        let guard = self.acquire(&table)?;

        state.transition(Phase::Cutover(CutoverState::LockAcquired))?;
        self.store.checkpoint(state)?;

        let altered = self.apply_in_place(state, &table);
        drop(guard);
        if let Err(err) = altered {
            state.transition(Phase::Cutover(CutoverState::Preparing))?;
            self.store.checkpoint(state)?;
            return Err(err);
        }

        state.transition(Phase::Cutover(CutoverState::Swapped))?;
        self.store.checkpoint(state)
    }

    fn apply_in_place(&self, state: &MigrationState, table: &str) -> Result<()> {
        let live = self.host.describe(table)?;
        if same_schema(&live, &state.target) {
            tracing::info!(migration_id = %state.migration_id, "schema change already applied");
            return Ok(());
        }
        let applied = apply_delta(&live, &state.spec.delta)?;
        self.host.alter_in_place(table, live.version, &applied.def)?;
        Ok(())
    }

    /// Remove the retired table and the capture. Failures are logged and do
    /// not fail the migration; the leftovers are named in the warning.
    pub fn cleanup(&self, state: &mut MigrationState, capture: Option<&dyn ChangeCapture>) -> Result<()> {
        if let (Some(capture), Some(handle)) = (capture, &state.capture) {
            if let Err(e) = capture.uninstall(handle) {
                tracing::warn!(
                    migration_id = %state.migration_id,
                    log_tree = %handle.log_tree,
                    error = %e,
                    "failed to remove change capture"
                );
            }
        }
        if let Some(retired) = &state.retired_table {
            match self.host.drop_table(retired) {
                Ok(_) => tracing::info!(migration_id = %state.migration_id, table = %retired, "retired table dropped"),
                Err(e) => tracing::warn!(
                    migration_id = %state.migration_id,
                    table = %retired,
                    error = %e,
                    "failed to drop retired table"
                ),
            }
        }
        if let Err(e) = self.store.release_target(state.table(), &state.migration_id) {
            tracing::warn!(migration_id = %state.migration_id, error = %e, "failed to release table claim");
        }
        if self.config.analyze {
            match self.host.analyze(state.table()) {
                Ok(stats) => tracing::info!(table = %state.table(), rows = stats.row_count, "statistics refreshed"),
                Err(e) => tracing::warn!(table = %state.table(), error = %e, "analyze failed"),
            }
        }

        state.transition(Phase::Cutover(CutoverState::Done))?;
        self.store.checkpoint(state)?;
        state.transition(Phase::Complete)?;
        self.store.checkpoint(state)
    }
}
