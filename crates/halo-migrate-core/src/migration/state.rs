//! Migration state and its persistence.
//!
//! A migration's record holds everything needed to resume it in a new
//! process: phase, copy cursor, last applied LSN and the identities of the
//! shadow table and change capture. Records live in the `migration:state`
//! tree of the host database, next to per-table claim keys that keep two
//! migrations off the same table.

use super::delta::RowTransform;
use super::error::{ErrorCategory, MigrateError, Result};
use super::spec::MigrationSpec;
use crate::capture::CaptureHandle;
use crate::catalog::TableDef;
use crate::error::rkyv_codec;
use crate::storage::key::current_timestamp;
use dashmap::DashMap;
use parking_lot::Mutex;
use rkyv::{Archive, Deserialize, Serialize};
use std::sync::Arc;

/// Cutover sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum CutoverState {
    Preparing,
    /// Exclusive lock held, draining the change log.
    LockAcquired,
    /// Shadow is live; the old table is retired.
    Swapped,
    Cleanup,
    Done,
    /// Gave up before the swap; the live table is unchanged.
    Aborted,
}

impl std::fmt::Display for CutoverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CutoverState::Preparing => write!(f, "preparing"),
            CutoverState::LockAcquired => write!(f, "lock_acquired"),
            CutoverState::Swapped => write!(f, "swapped"),
            CutoverState::Cleanup => write!(f, "cleanup"),
            CutoverState::Done => write!(f, "done"),
            CutoverState::Aborted => write!(f, "aborted"),
        }
    }
}

/// Phase of a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Copying,
    BuildingIndexes,
    Syncing,
    Cutover(CutoverState),
    Complete,
    Aborted,
}

impl Phase {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use CutoverState as C;
        use Phase::*;
        match (self, next) {
            (Complete | Aborted, _) => false,
            (Cutover(C::Swapped | C::Cleanup | C::Done), Aborted) => false,
            (_, Aborted) => true,
            (Pending, Copying) | (Pending, Cutover(C::Preparing)) => true,
            (Copying, BuildingIndexes) => true,
            (BuildingIndexes, Syncing) => true,
            (Syncing, Cutover(C::Preparing)) => true,
            // re-copy after a capture gap
            (BuildingIndexes | Syncing | Cutover(C::Preparing), Copying) => true,
            (Cutover(C::Preparing), Cutover(C::LockAcquired | C::Aborted)) => true,
            (Cutover(C::LockAcquired), Cutover(C::Preparing | C::Swapped | C::Aborted)) => true,
            (Cutover(C::Swapped), Cutover(C::Cleanup)) => true,
            (Cutover(C::Cleanup), Cutover(C::Done)) => true,
            (Cutover(C::Done), Complete) => true,
            (Cutover(C::Aborted), Syncing) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Aborted)
    }

    /// Whether the shadow table has replaced the live table.
    pub fn is_swapped(self) -> bool {
        matches!(
            self,
            Phase::Cutover(CutoverState::Swapped | CutoverState::Cleanup | CutoverState::Done)
                | Phase::Complete
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pending => write!(f, "pending"),
            Phase::Copying => write!(f, "copying"),
            Phase::BuildingIndexes => write!(f, "building_indexes"),
            Phase::Syncing => write!(f, "syncing"),
            Phase::Cutover(state) => write!(f, "cutover:{}", state),
            Phase::Complete => write!(f, "complete"),
            Phase::Aborted => write!(f, "aborted"),
        }
    }
}

/// Run status, independent of the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Created, not yet run.
    Pending,
    Running,
    /// Stopped on request; resumable.
    Paused,
    /// Stopped by a transient error; resumable.
    Stalled,
    /// Stopped by a user or fatal error.
    Failed,
    Complete,
    Aborted,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Running => write!(f, "running"),
            MigrationStatus::Paused => write!(f, "paused"),
            MigrationStatus::Stalled => write!(f, "stalled"),
            MigrationStatus::Failed => write!(f, "failed"),
            MigrationStatus::Complete => write!(f, "complete"),
            MigrationStatus::Aborted => write!(f, "aborted"),
        }
    }
}

impl MigrationStatus {
    /// Status a run ends in after `err`.
    pub fn after_error(err: &MigrateError) -> Self {
        match err {
            MigrateError::Cancelled => MigrationStatus::Paused,
            MigrateError::ShadowSetup(_) => MigrationStatus::Aborted,
            e if e.category() == ErrorCategory::Transient => MigrationStatus::Stalled,
            _ => MigrationStatus::Failed,
        }
    }
}

/// The shadow table of a copy migration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ShadowRef {
    pub table: String,
    pub storage_id: u64,
    pub transform: RowTransform,
}

/// Copy cursor.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct CopyProgress {
    /// Primary key of the last copied row.
    pub last_key: Option<Vec<u8>>,
    pub rows_copied: u64,
    /// Live row count when the copy started.
    pub total_rows: u64,
    /// The shadow may hold rows deleted from the live table while capture
    /// was down; remove them after the copy.
    pub needs_prune: bool,
}

impl CopyProgress {
    pub fn percent_complete(&self) -> f64 {
        if self.total_rows == 0 {
            100.0
        } else {
            (self.rows_copied as f64 / self.total_rows as f64 * 100.0).min(100.0)
        }
    }
}

/// Last error of a run.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub category: ErrorCategory,
    pub message: String,
    pub at: u64,
}

impl From<&MigrateError> for ErrorRecord {
    fn from(err: &MigrateError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
            at: current_timestamp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub at: u64,
}

/// Persistent record of one migration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct MigrationState {
    pub migration_id: String,
    pub spec: MigrationSpec,
    /// Planned definition of the table after the migration.
    pub target: TableDef,
    pub phase: Phase,
    pub status: MigrationStatus,
    pub shadow: Option<ShadowRef>,
    pub capture: Option<CaptureHandle>,
    /// Name of the previous live table after the swap.
    pub retired_table: Option<String>,
    pub copy: CopyProgress,
    /// Highest LSN applied to the shadow.
    pub last_applied_lsn: u64,
    pub entries_applied: u64,
    pub cutover_attempts: u32,
    pub created_at: u64,
    pub updated_at: u64,
    pub completed_at: Option<u64>,
    pub last_error: Option<ErrorRecord>,
    pub history: Vec<PhaseTransition>,
    /// Bumped on every save.
    pub revision: u64,
}

rkyv_codec!(MigrationState);

impl MigrationState {
    pub fn new(spec: MigrationSpec, target: TableDef) -> Self {
        let now = current_timestamp();
        Self {
            migration_id: spec.migration_id.clone(),
            spec,
            target,
            phase: Phase::Pending,
            status: MigrationStatus::Pending,
            shadow: None,
            capture: None,
            retired_table: None,
            copy: CopyProgress::default(),
            last_applied_lsn: 0,
            entries_applied: 0,
            cutover_attempts: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            last_error: None,
            history: Vec::new(),
            revision: 0,
        }
    }

    pub fn table(&self) -> &str {
        &self.spec.table
    }

    /// Move to `next`, recording the transition.
    pub fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(MigrateError::InvalidTransition {
                migration_id: self.migration_id.clone(),
                action: "advance",
                reason: format!("{} cannot move to {}", self.phase, next),
            });
        }
        let now = current_timestamp();
        tracing::info!(
            migration_id = %self.migration_id,
            from = %self.phase,
            to = %next,
            "migration phase changed"
        );
        self.history.push(PhaseTransition {
            from: self.phase,
            to: next,
            at: now,
        });
        self.phase = next;
        self.updated_at = now;
        match next {
            Phase::Complete => {
                self.status = MigrationStatus::Complete;
                self.completed_at = Some(now);
            }
            Phase::Aborted => {
                self.status = MigrationStatus::Aborted;
                self.completed_at = Some(now);
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a process can pick the migration up again.
    pub fn can_resume(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// Shadow reference, or corruption if a phase that needs one has none.
    pub fn shadow_ref(&self) -> Result<&ShadowRef> {
        self.shadow.as_ref().ok_or_else(|| {
            MigrateError::ShadowCorrupted(format!(
                "migration {} in phase {} has no shadow table",
                self.migration_id, self.phase
            ))
        })
    }

    pub fn capture_handle(&self) -> Result<&CaptureHandle> {
        self.capture.as_ref().ok_or_else(|| {
            MigrateError::ShadowCorrupted(format!(
                "migration {} in phase {} has no change capture",
                self.migration_id, self.phase
            ))
        })
    }
}

/// Persistent store of migration records.
pub struct MigrationStateStore {
    tree: sled::Tree,
    save_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MigrationStateStore {
    /// Tree name for migration state.
    pub const TREE_NAME: &'static str = "migration:state";

    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree(Self::TREE_NAME).map_err(unavailable)?;
        Ok(Self {
            tree,
            save_locks: DashMap::new(),
        })
    }

    /// Save `state`, bumping its revision.
    ///
    /// Fails with [`MigrateError::StateConflict`] if the stored record is
    /// newer than the one `state` was loaded from.
    pub fn save(&self, state: &mut MigrationState) -> Result<()> {
        let lock = self
            .save_locks
            .entry(state.migration_id.clone())
            .or_default()
            .value()
            .clone();
        let _serial = lock.lock();

        let key = Self::migration_key(&state.migration_id);
        if let Some(stored) = self.tree.get(&key).map_err(unavailable)? {
            let stored = decode(&stored)?;
            if stored.revision > state.revision {
                return Err(MigrateError::StateConflict(state.migration_id.clone()));
            }
        }

        let mut next = state.clone();
        next.revision += 1;
        next.updated_at = current_timestamp();
        let bytes = next
            .to_bytes()
            .map_err(|e| MigrateError::StateCorrupted(e.to_string()))?;
        self.tree.insert(key, bytes).map_err(unavailable)?;
        *state = next;
        Ok(())
    }

    /// Save and flush to disk.
    pub fn checkpoint(&self, state: &mut MigrationState) -> Result<()> {
        self.save(state)?;
        self.flush()
    }

    pub fn get(&self, migration_id: &str) -> Result<Option<MigrationState>> {
        match self
            .tree
            .get(Self::migration_key(migration_id))
            .map_err(unavailable)?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load(&self, migration_id: &str) -> Result<MigrationState> {
        self.get(migration_id)?
            .ok_or_else(|| MigrateError::MigrationNotFound(migration_id.to_string()))
    }

    /// Delete a record. Returns `false` if it did not exist.
    pub fn clear(&self, migration_id: &str) -> Result<bool> {
        let removed = self
            .tree
            .remove(Self::migration_key(migration_id))
            .map_err(unavailable)?;
        self.save_locks.remove(migration_id);
        Ok(removed.is_some())
    }

    /// All records, ordered by creation time.
    pub fn list(&self) -> Result<Vec<MigrationState>> {
        let mut states = Vec::new();
        for result in self.tree.scan_prefix(b"migration:") {
            let (_, value) = result.map_err(unavailable)?;
            states.push(decode(&value)?);
        }
        states.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.migration_id.cmp(&b.migration_id))
        });
        Ok(states)
    }

    /// Migration holding the claim on `table`, if any.
    pub fn active_for_target(&self, table: &str) -> Result<Option<MigrationState>> {
        match self
            .tree
            .get(Self::target_key(table))
            .map_err(unavailable)?
        {
            Some(owner) => {
                let owner = String::from_utf8_lossy(&owner).into_owned();
                self.get(&owner)
            }
            None => Ok(None),
        }
    }

    /// Claim `table` for `migration_id`. Claiming twice is a no-op.
    pub fn claim_target(&self, table: &str, migration_id: &str) -> Result<()> {
        let key = Self::target_key(table);
        match self
            .tree
            .compare_and_swap(&key, None as Option<&[u8]>, Some(migration_id.as_bytes()))
            .map_err(unavailable)?
        {
            Ok(()) => Ok(()),
            Err(current) => match current.current {
                Some(owner) if &*owner == migration_id.as_bytes() => Ok(()),
                Some(owner) => Err(MigrateError::MigrationInProgress {
                    table: table.to_string(),
                    migration_id: String::from_utf8_lossy(&owner).into_owned(),
                }),
                // released between the attempt and now
                None => self.claim_target(table, migration_id),
            },
        }
    }

    /// Release the claim on `table` if `migration_id` holds it.
    pub fn release_target(&self, table: &str, migration_id: &str) -> Result<bool> {
        let released = self
            .tree
            .compare_and_swap(
                Self::target_key(table),
                Some(migration_id.as_bytes()),
                None as Option<&[u8]>,
            )
            .map_err(unavailable)?;
        Ok(released.is_ok())
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush().map_err(unavailable)?;
        Ok(())
    }

    fn migration_key(migration_id: &str) -> Vec<u8> {
        format!("migration:{}", migration_id).into_bytes()
    }

    fn target_key(table: &str) -> Vec<u8> {
        format!("target:{}", table).into_bytes()
    }
}

fn unavailable(err: sled::Error) -> MigrateError {
    MigrateError::StateStoreUnavailable(err.to_string())
}

fn decode(bytes: &[u8]) -> Result<MigrationState> {
    MigrationState::from_bytes(bytes).map_err(|e| MigrateError::StateCorrupted(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureKind;
    use crate::catalog::{ColumnDef, ColumnType};
    use crate::migration::spec::{SchemaDelta, Strategy};
    use pretty_assertions::assert_eq;

    fn state(id: &str) -> MigrationState {
        let (_, delta) = SchemaDelta::parse("ADD COLUMN score int").unwrap();
        let target = TableDef::new(
            "accounts",
            vec![
                ColumnDef::new("id", ColumnType::Int).not_null(),
                ColumnDef::new("score", ColumnType::Int),
            ],
            vec!["id"],
        );
        MigrationState::new(
            MigrationSpec {
                migration_id: id.to_string(),
                table: "accounts".into(),
                delta,
                alter_text: "ADD COLUMN score int".into(),
                strategy: Strategy::Copy,
                capture: CaptureKind::Trigger,
                base_version: 1,
            },
            target,
        )
    }

    fn store() -> (tempfile::TempDir, MigrationStateStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = MigrationStateStore::open(&db).unwrap();
        (dir, store)
    }

    #[test]
    fn test_transitions() {
        use CutoverState as C;
        assert!(Phase::Pending.can_transition_to(Phase::Copying));
        assert!(Phase::Syncing.can_transition_to(Phase::Cutover(C::Preparing)));
        assert!(Phase::Cutover(C::LockAcquired).can_transition_to(Phase::Cutover(C::Swapped)));
        assert!(Phase::Cutover(C::Aborted).can_transition_to(Phase::Syncing));
        assert!(Phase::Cutover(C::LockAcquired).can_transition_to(Phase::Aborted));

        assert!(!Phase::Copying.can_transition_to(Phase::Syncing));
        assert!(!Phase::Cutover(C::Swapped).can_transition_to(Phase::Aborted));
        assert!(!Phase::Complete.can_transition_to(Phase::Aborted));
        assert!(!Phase::Aborted.can_transition_to(Phase::Pending));
    }

    #[test]
    fn test_transition_records_history() {
        let mut s = state("m1");
        s.transition(Phase::Copying).unwrap();
        assert!(s.transition(Phase::Syncing).is_err());
        s.transition(Phase::Aborted).unwrap();
        assert_eq!(s.status, MigrationStatus::Aborted);
        assert!(s.completed_at.is_some());
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.history[0].from, Phase::Pending);
    }

    #[test]
    fn test_save_load_clear() {
        let (_dir, store) = store();
        let mut s = state("m1");
        store.save(&mut s).unwrap();
        assert_eq!(s.revision, 1);

        s.transition(Phase::Copying).unwrap();
        s.copy.last_key = Some(vec![1, 2, 3]);
        store.checkpoint(&mut s).unwrap();

        let loaded = store.load("m1").unwrap();
        assert_eq!(loaded, s);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(store.clear("m1").unwrap());
        assert!(matches!(store.load("m1"), Err(MigrateError::MigrationNotFound(_))));
    }

    #[test]
    fn test_stale_save_conflicts() {
        let (_dir, store) = store();
        let mut s = state("m1");
        store.save(&mut s).unwrap();

        let mut stale = store.load("m1").unwrap();
        store.save(&mut s).unwrap();
        stale.status = MigrationStatus::Paused;
        assert!(matches!(
            store.save(&mut stale),
            Err(MigrateError::StateConflict(_))
        ));
    }

    #[test]
    fn test_target_claims() {
        let (_dir, store) = store();
        let mut s = state("m1");
        store.save(&mut s).unwrap();

        store.claim_target("accounts", "m1").unwrap();
        store.claim_target("accounts", "m1").unwrap();
        assert!(matches!(
            store.claim_target("accounts", "m2"),
            Err(MigrateError::MigrationInProgress { ref migration_id, .. }) if migration_id == "m1"
        ));
        assert_eq!(
            store.active_for_target("accounts").unwrap().unwrap().migration_id,
            "m1"
        );

        assert!(!store.release_target("accounts", "m2").unwrap());
        assert!(store.release_target("accounts", "m1").unwrap());
        store.claim_target("accounts", "m2").unwrap();
        // claim keys are not migration records
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_corrupted_record() {
        let (_dir, store) = store();
        store.tree.insert(b"migration:bad", b"garbage".to_vec()).unwrap();
        assert!(matches!(store.load("bad"), Err(MigrateError::StateCorrupted(_))));
    }
}
