//! Migration executor - orchestrates the migration workflow.
//!
//! Drives a migration through its phases, one saved step at a time:
//!
//! ```text
//! Pending -> Copying -> BuildingIndexes -> Syncing -> Cutover(..) -> Complete
//!    \_______ in place ______________________________/
//! ```
//!
//! Any process can pick a migration up from its saved state. Errors stop the
//! run and are recorded on the migration; transient ones leave it resumable.

use super::cancel::CancellationToken;
use super::config::MigrationConfig;
use super::cutover::CutoverCoordinator;
use super::error::{MigrateError, Result};
use super::planner::{MigrationPlan, Planner};
use super::shadow::{is_migration_table, ShadowManager};
use super::spec::{MigrationRequest, MigrationSpec, SchemaDelta, Strategy};
use super::state::{
    CopyProgress, CutoverState, ErrorRecord, MigrationState, MigrationStateStore, MigrationStatus,
    Phase,
};
use super::sync::SyncEngine;
use crate::capture::{CaptureKind, ChangeCapture};
use crate::catalog::TableDef;
use crate::error::Error;
use crate::host::HostDatabase;
use crate::storage::StorageEngine;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Generate a migration id: 8 random hex digits.
pub fn generate_migration_id() -> String {
    hex::encode(rand::random::<[u8; 4]>())
}

/// Check a caller-supplied migration id.
pub fn validate_migration_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 32
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(MigrateError::InvalidId(id.to_string()))
    }
}

/// Checked request, ready to be planned into a migration.
struct Prepared {
    migration_id: String,
    live: TableDef,
    delta: SchemaDelta,
    capture: CaptureKind,
    plan: MigrationPlan,
}

/// Migration executor.
pub struct Executor<H: HostDatabase> {
    host: H,
    store: MigrationStateStore,
    config: MigrationConfig,
    /// Cancellation tokens of runs in this process.
    running: DashMap<String, CancellationToken>,
    /// Held for the duration of a run, pause or abort.
    run_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Migrations whose capture this process has attached to.
    attached: Mutex<HashSet<String>>,
}

impl Executor<StorageEngine> {
    /// Executor over the embedded engine, keeping state in the same database.
    pub fn open(engine: StorageEngine, config: MigrationConfig) -> Result<Self> {
        let store = MigrationStateStore::open(engine.db())?;
        Ok(Self::new(engine, store, config))
    }
}

impl<H: HostDatabase> Executor<H> {
    pub fn new(host: H, store: MigrationStateStore, config: MigrationConfig) -> Self {
        Self {
            host,
            store,
            config,
            running: DashMap::new(),
            run_locks: DashMap::new(),
            attached: Mutex::new(HashSet::new()),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn store(&self) -> &MigrationStateStore {
        &self.store
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Plan a migration without changing anything.
    pub fn plan(&self, request: &MigrationRequest) -> Result<MigrationPlan> {
        Ok(self.prepare(request)?.plan)
    }

    /// Validate, plan and record a migration, claiming its table. The
    /// migration does not run until [`run`](Self::run) is called.
    ///
    /// An id may be reused once its previous migration was aborted.
    pub fn start(&self, request: MigrationRequest) -> Result<MigrationState> {
        let Prepared {
            migration_id,
            live,
            delta,
            capture,
            plan,
        } = self.prepare(&request)?;

        if let Some(existing) = self.store.get(&migration_id)? {
            if existing.phase != Phase::Aborted {
                return Err(MigrateError::InvalidTransition {
                    migration_id,
                    action: "start",
                    reason: format!("a migration with this id is {}", existing.phase),
                });
            }
            self.store.clear(&migration_id)?;
        }
        self.store.claim_target(&live.name, &migration_id)?;

        let spec = MigrationSpec {
            migration_id: migration_id.clone(),
            table: live.name.clone(),
            delta,
            alter_text: request.alter.clone(),
            strategy: plan.strategy,
            capture,
            base_version: live.version,
        };
        let mut state = MigrationState::new(spec, plan.target);
        if let Err(e) = self.store.checkpoint(&mut state) {
            if let Err(release) = self.store.release_target(&live.name, &migration_id) {
                tracing::warn!(migration_id = %migration_id, error = %release, "failed to release table claim");
            }
            return Err(e);
        }
        self.attached.lock().remove(&migration_id);

        tracing::info!(
            migration_id = %migration_id,
            table = %live.name,
            strategy = %plan.strategy,
            capture = %capture,
            steps = plan.steps.len(),
            "migration started"
        );
        Ok(state)
    }

    /// Run a migration until it completes or stops on an error.
    ///
    /// Cancelling `cancel`, or calling [`pause`](Self::pause), stops the run
    /// at the next batch boundary with [`MigrateError::Cancelled`] and leaves
    /// the migration paused.
    pub fn run(&self, migration_id: &str, cancel: &CancellationToken) -> Result<MigrationState> {
        self.run_steps(migration_id, cancel, None)
    }

    /// Run a single step. The migration is left paused unless the step
    /// finished it.
    pub fn advance(&self, migration_id: &str, cancel: &CancellationToken) -> Result<MigrationState> {
        self.run_steps(migration_id, cancel, Some(1))
    }

    /// Continue a paused, stalled or failed migration.
    pub fn resume(&self, migration_id: &str, cancel: &CancellationToken) -> Result<MigrationState> {
        let state = self.store.load(migration_id)?;
        if state.phase.is_terminal() {
            return Err(MigrateError::InvalidTransition {
                migration_id: migration_id.to_string(),
                action: "resume",
                reason: format!("migration is {}", state.phase),
            });
        }
        self.run(migration_id, cancel)
    }

    /// Stop a migration at the next batch boundary and mark it paused.
    /// Waits for a run in this process to stop.
    pub fn pause(&self, migration_id: &str) -> Result<MigrationState> {
        self.cancel_running(migration_id);
        let lock = self.run_lock(migration_id);
        let _serial = lock.lock();

        let mut state = self.store.load(migration_id)?;
        if state.phase.is_terminal() {
            return Err(MigrateError::InvalidTransition {
                migration_id: migration_id.to_string(),
                action: "pause",
                reason: format!("migration is {}", state.phase),
            });
        }
        if state.status != MigrationStatus::Paused {
            state.status = MigrationStatus::Paused;
            self.store.checkpoint(&mut state)?;
        }
        tracing::info!(migration_id, phase = %state.phase, "migration paused");
        Ok(state)
    }

    /// Abort a migration that has not swapped yet: drop the shadow table and
    /// the capture and release the table. The live table is never touched.
    /// Aborting twice is a no-op.
    pub fn abort(&self, migration_id: &str) -> Result<MigrationState> {
        self.cancel_running(migration_id);
        let lock = self.run_lock(migration_id);
        let _serial = lock.lock();

        let mut state = self.store.load(migration_id)?;
        self.resolve_lock_acquired(&mut state)?;
        match state.phase {
            Phase::Aborted => return Ok(state),
            Phase::Complete => {
                return Err(MigrateError::InvalidTransition {
                    migration_id: migration_id.to_string(),
                    action: "abort",
                    reason: "migration already completed".to_string(),
                })
            }
            phase if phase.is_swapped() => {
                return Err(MigrateError::InvalidTransition {
                    migration_id: migration_id.to_string(),
                    action: "abort",
                    reason: "the new table is already live; resume to finish cleanup".to_string(),
                })
            }
            _ => {}
        }

        self.tear_down(&mut state)?;
        tracing::info!(migration_id, table = %state.table(), "migration aborted");
        Ok(state)
    }

    pub fn status(&self, migration_id: &str) -> Result<MigrationState> {
        self.store.load(migration_id)
    }

    pub fn list(&self) -> Result<Vec<MigrationState>> {
        self.store.list()
    }

    fn prepare(&self, request: &MigrationRequest) -> Result<Prepared> {
        let migration_id = match &request.migration_id {
            Some(id) => {
                validate_migration_id(id)?;
                id.clone()
            }
            None => generate_migration_id(),
        };

        let (named, delta) = SchemaDelta::parse(&request.alter)?;
        if let Some(named) = named {
            if named != request.table {
                return Err(MigrateError::UnsupportedDelta(format!(
                    "ALTER names table {} but the target is {}",
                    named, request.table
                )));
            }
        }
        if is_migration_table(&request.table) {
            return Err(MigrateError::InvalidTarget {
                table: request.table.clone(),
                reason: "table belongs to a migration".to_string(),
            });
        }

        let live = self.describe_target(&request.table)?;
        if let Some(binding) = &live.capture {
            return Err(MigrateError::MigrationInProgress {
                table: live.name.clone(),
                migration_id: binding.migration_id.clone(),
            });
        }
        if let Some(active) = self.store.active_for_target(&live.name)? {
            if active.migration_id != migration_id {
                return Err(MigrateError::MigrationInProgress {
                    table: live.name.clone(),
                    migration_id: active.migration_id,
                });
            }
        }

        let plan = Planner::plan(
            &migration_id,
            &live,
            &delta,
            request.strategy,
            self.config.cutover.analyze,
        )?;
        Ok(Prepared {
            migration_id,
            live,
            delta,
            capture: request.capture.unwrap_or(self.config.capture),
            plan,
        })
    }

    fn describe_target(&self, table: &str) -> Result<TableDef> {
        match self.host.describe(table) {
            Ok(def) => Ok(def),
            Err(Error::TableNotFound(_)) => Err(MigrateError::InvalidTarget {
                table: table.to_string(),
                reason: "table does not exist".to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn run_lock(&self, migration_id: &str) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(migration_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    fn cancel_running(&self, migration_id: &str) {
        let token = self.running.get(migration_id).map(|t| t.value().clone());
        if let Some(token) = token {
            token.cancel();
        }
    }

    fn run_steps(
        &self,
        migration_id: &str,
        cancel: &CancellationToken,
        max_steps: Option<usize>,
    ) -> Result<MigrationState> {
        let lock = self.run_lock(migration_id);
        let _serial = lock.lock();
        self.running
            .insert(migration_id.to_string(), cancel.clone());
        let result = self.drive(migration_id, cancel, max_steps);
        self.running.remove(migration_id);
        result.map_err(|err| self.record_failure(migration_id, err))
    }

    fn drive(
        &self,
        migration_id: &str,
        cancel: &CancellationToken,
        max_steps: Option<usize>,
    ) -> Result<MigrationState> {
        let mut state = self.store.load(migration_id)?;
        if state.phase.is_terminal() {
            return Ok(state);
        }
        state.status = MigrationStatus::Running;
        state.last_error = None;
        self.store.save(&mut state)?;

        let mut steps = 0;
        while !state.phase.is_terminal() && max_steps.map_or(true, |max| steps < max) {
            self.step(&mut state, cancel)?;
            steps += 1;
        }
        if !state.phase.is_terminal() {
            state.status = MigrationStatus::Paused;
            self.store.checkpoint(&mut state)?;
        }
        Ok(state)
    }

    /// Record `err` on the stored migration and hand it back.
    ///
    /// A migration that failed on its data before the swap is torn down and
    /// left aborted.
    fn record_failure(&self, migration_id: &str, err: MigrateError) -> MigrateError {
        if matches!(err, MigrateError::Storage(Error::CaptureInactive(_))) {
            // the next run must attach again
            self.attached.lock().remove(migration_id);
        }
        let recorded = self.store.get(migration_id).and_then(|state| match state {
            Some(mut state) => {
                state.status = MigrationStatus::after_error(&err);
                state.last_error = Some(ErrorRecord::from(&err));
                if err.aborts_migration() && !state.phase.is_terminal() {
                    self.abandon(&mut state)
                } else {
                    self.store.checkpoint(&mut state)
                }
            }
            None => Ok(()),
        });
        if let Err(e) = recorded {
            tracing::warn!(migration_id, error = %e, "failed to record migration error");
        }
        match &err {
            MigrateError::Cancelled => tracing::info!(migration_id, "migration stopped on request"),
            _ => tracing::error!(
                migration_id,
                category = %err.category(),
                error = %err,
                "migration stopped"
            ),
        }
        err
    }

    fn step(&self, state: &mut MigrationState, cancel: &CancellationToken) -> Result<()> {
        let capture = self.host.change_capture(state.spec.capture);
        let sync = SyncEngine::new(
            &self.host,
            capture.as_ref(),
            &self.store,
            &self.config.sync,
            cancel,
        );
        let cutover = CutoverCoordinator::new(&self.host, &self.store, &self.config.cutover, cancel);
        let copy = state.spec.strategy == Strategy::Copy;

        match state.phase {
            Phase::Pending => self.setup(state),
            Phase::Copying => {
                if self.ensure_attached(state, capture.as_ref(), &sync)? {
                    return Ok(());
                }
                sync.copy(state)?;
                state.transition(Phase::BuildingIndexes)?;
                self.store.checkpoint(state)
            }
            Phase::BuildingIndexes => {
                if self.ensure_attached(state, capture.as_ref(), &sync)? {
                    return Ok(());
                }
                sync.catch_up(state)?;
                let shadow = state.shadow_ref()?.table.clone();
                let built = self.host.build_unique_indexes(&shadow)?;
                tracing::info!(migration_id = %state.migration_id, entries = built, "unique indexes built");
                state.transition(Phase::Syncing)?;
                self.store.checkpoint(state)
            }
            Phase::Syncing => {
                if self.ensure_attached(state, capture.as_ref(), &sync)? {
                    return Ok(());
                }
                sync.converge(state)?;
                state.transition(Phase::Cutover(CutoverState::Preparing))?;
                self.store.checkpoint(state)
            }
            Phase::Cutover(CutoverState::Preparing) if copy => {
                if self.ensure_attached(state, capture.as_ref(), &sync)? {
                    return Ok(());
                }
                cutover.lock_and_swap(state, &sync, capture.as_ref())
            }
            Phase::Cutover(CutoverState::Preparing) => cutover.alter_in_place(state),
            Phase::Cutover(CutoverState::LockAcquired) => cutover.resolve_lock_acquired(state),
            Phase::Cutover(CutoverState::Swapped) => {
                state.transition(Phase::Cutover(CutoverState::Cleanup))?;
                self.store.checkpoint(state)
            }
            Phase::Cutover(CutoverState::Cleanup) => {
                cutover.cleanup(state, copy.then_some(capture.as_ref()))?;
                self.attached.lock().remove(&state.migration_id);
                tracing::info!(
                    migration_id = %state.migration_id,
                    table = %state.table(),
                    entries_applied = state.entries_applied,
                    "migration complete"
                );
                Ok(())
            }
            Phase::Cutover(CutoverState::Done) => {
                state.transition(Phase::Complete)?;
                self.store.checkpoint(state)
            }
            Phase::Cutover(CutoverState::Aborted) => {
                state.transition(Phase::Syncing)?;
                self.store.checkpoint(state)
            }
            Phase::Complete | Phase::Aborted => Ok(()),
        }
    }

    /// Pending: create the shadow table and capture, or go straight to the
    /// cutover for in-place migrations. A failed setup aborts the migration.
    fn setup(&self, state: &mut MigrationState) -> Result<()> {
        let shadows = ShadowManager::new(&self.host, self.config.setup_lock_timeout);
        if state.spec.strategy == Strategy::Copy {
            // leftovers of a setup interrupted by a crash
            shadows.discard(state)?;
        }

        let live = self.describe_target(state.table())?;
        let plan = Planner::plan(
            &state.migration_id,
            &live,
            &state.spec.delta,
            Some(state.spec.strategy),
            self.config.cutover.analyze,
        )?;
        state.spec.base_version = live.version;
        state.target = plan.target;

        if state.spec.strategy == Strategy::InPlace {
            state.transition(Phase::Cutover(CutoverState::Preparing))?;
            return self.store.checkpoint(state);
        }

        match shadows.setup(state, plan.transform) {
            Ok((shadow, handle)) => {
                state.shadow = Some(shadow);
                state.capture = Some(handle);
                state.copy = CopyProgress::default();
                state.last_applied_lsn = 0;
                state.transition(Phase::Copying)?;
                self.store.checkpoint(state)?;
                self.attached.lock().insert(state.migration_id.clone());
                Ok(())
            }
            Err(err) => {
                tracing::warn!(migration_id = %state.migration_id, error = %err, "shadow setup failed");
                if let Err(e) = shadows.discard(state) {
                    tracing::warn!(migration_id = %state.migration_id, error = %e, "failed to remove partial shadow");
                }
                if let Err(e) = self.store.release_target(state.table(), &state.migration_id) {
                    tracing::warn!(migration_id = %state.migration_id, error = %e, "failed to release table claim");
                }
                state.last_error = Some(ErrorRecord::from(&err));
                state.transition(Phase::Aborted)?;
                self.store.checkpoint(state)?;
                Err(MigrateError::ShadowSetup(err.to_string()))
            }
        }
    }

    /// Settle a `LockAcquired` record left by a crash into `Swapped` or
    /// `Preparing`, by looking at the live table.
    fn resolve_lock_acquired(&self, state: &mut MigrationState) -> Result<()> {
        if state.phase != Phase::Cutover(CutoverState::LockAcquired) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        CutoverCoordinator::new(&self.host, &self.store, &self.config.cutover, &cancel)
            .resolve_lock_acquired(state)
    }

    /// Give up on a migration after an error that no retry can fix. Does
    /// nothing once the new table is live.
    fn abandon(&self, state: &mut MigrationState) -> Result<()> {
        self.resolve_lock_acquired(state)?;
        if state.phase.is_swapped() {
            return self.store.checkpoint(state);
        }
        self.tear_down(state)?;
        tracing::warn!(
            migration_id = %state.migration_id,
            table = %state.table(),
            "migration aborted, live table unchanged"
        );
        Ok(())
    }

    /// Drop the shadow table and capture, release the table and mark the
    /// migration aborted. Only valid before the swap.
    fn tear_down(&self, state: &mut MigrationState) -> Result<()> {
        if state.spec.strategy == Strategy::Copy {
            ShadowManager::new(&self.host, self.config.setup_lock_timeout).discard(state)?;
        }
        self.store.release_target(state.table(), &state.migration_id)?;
        state.transition(Phase::Aborted)?;
        self.store.checkpoint(state)?;
        self.attached.lock().remove(&state.migration_id);
        Ok(())
    }

    /// Attach to the migration's capture once per process. Returns `true` if
    /// writes were missed and the copy was restarted.
    fn ensure_attached(
        &self,
        state: &mut MigrationState,
        capture: &dyn ChangeCapture,
        sync: &SyncEngine<'_>,
    ) -> Result<bool> {
        if self.attached.lock().contains(&state.migration_id) {
            return Ok(false);
        }
        let handle = state.capture_handle()?.clone();
        let stale = capture.high_water(&handle)?;
        let intact = capture.attach(&handle)?;
        self.attached.lock().insert(state.migration_id.clone());
        if intact {
            tracing::debug!(migration_id = %state.migration_id, capture = %handle.kind, "reattached change capture");
            return Ok(false);
        }
        sync.restart_after_gap(state, stale)?;
        Ok(true)
    }
}
