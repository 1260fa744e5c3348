//! Migration planning.
//!
//! Turns a schema delta and the live table definition into the ordered steps
//! of a migration, with the lock each step takes on the live table.

use super::delta::{apply_delta, RowTransform};
use super::error::{MigrateError, Result};
use super::shadow::{retired_table_name, shadow_table_name};
use super::spec::{SchemaDelta, Strategy};
use crate::catalog::TableDef;

/// Lock a step holds on the live table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// No lock; application writes proceed.
    None,
    /// Per-row writes, serialized with application writes row by row.
    Row,
    /// Brief exclusive table lock; application writes wait.
    TableExclusive,
}

impl std::fmt::Display for LockLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockLevel::None => write!(f, "none"),
            LockLevel::Row => write!(f, "row"),
            LockLevel::TableExclusive => write!(f, "exclusive"),
        }
    }
}

/// Kind of plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    ClaimTarget,
    SetupShadow,
    CopyRows,
    BuildIndexes,
    ApplyLog,
    Swap,
    DropRetired,
    AlterInPlace,
    Analyze,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StepKind::ClaimTarget => "claim_target",
            StepKind::SetupShadow => "setup_shadow",
            StepKind::CopyRows => "copy_rows",
            StepKind::BuildIndexes => "build_indexes",
            StepKind::ApplyLog => "apply_log",
            StepKind::Swap => "swap",
            StepKind::DropRetired => "drop_retired",
            StepKind::AlterInPlace => "alter_in_place",
            StepKind::Analyze => "analyze",
        };
        write!(f, "{}", name)
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub kind: StepKind,
    pub lock: LockLevel,
    pub description: String,
}

impl PlanStep {
    fn new(kind: StepKind, lock: LockLevel, description: impl Into<String>) -> Self {
        Self {
            kind,
            lock,
            description: description.into(),
        }
    }
}

/// Ordered steps of a migration.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    pub migration_id: String,
    pub table: String,
    pub strategy: Strategy,
    /// Target definition of the live table.
    pub target: TableDef,
    /// Live row to target row mapping. Identity for in-place plans.
    pub transform: RowTransform,
    /// Whether the delta rewrites or revalidates rows.
    pub rewrites_rows: bool,
    pub steps: Vec<PlanStep>,
    /// Rows in the live table when planned, if known.
    pub estimated_rows: Option<u64>,
}

impl MigrationPlan {
    /// Strongest lock taken by any step.
    pub fn max_lock(&self) -> LockLevel {
        self.steps
            .iter()
            .map(|s| s.lock)
            .max()
            .unwrap_or(LockLevel::None)
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Plans migrations.
pub struct Planner;

impl Planner {
    /// Plan `delta` against `live`.
    ///
    /// Row-rewriting deltas always use the copy strategy; asking for an
    /// in-place run of one is rejected. Metadata-only deltas default to
    /// in-place.
    pub fn plan(
        migration_id: &str,
        live: &TableDef,
        delta: &SchemaDelta,
        requested: Option<Strategy>,
        analyze: bool,
    ) -> Result<MigrationPlan> {
        let applied = apply_delta(live, delta)?;
        let rewrites_rows = delta.rewrites_rows();

        let strategy = match (requested, rewrites_rows) {
            (Some(Strategy::InPlace), true) => {
                let op = delta
                    .ops
                    .iter()
                    .find(|op| op.rewrites_rows())
                    .map(|op| op.describe())
                    .unwrap_or_default();
                return Err(MigrateError::UnsupportedDelta(format!(
                    "{} rewrites rows and cannot run in place",
                    op
                )));
            }
            (Some(strategy), _) => strategy,
            (None, true) => Strategy::Copy,
            (None, false) => Strategy::InPlace,
        };

        let table = &live.name;
        let mut steps = vec![PlanStep::new(
            StepKind::ClaimTarget,
            LockLevel::None,
            format!("claim table {} for migration {}", table, migration_id),
        )];

        let transform = match strategy {
            Strategy::Copy => {
                let shadow = shadow_table_name(table, migration_id);
                steps.push(PlanStep::new(
                    StepKind::SetupShadow,
                    LockLevel::TableExclusive,
                    format!("create shadow table {} and install change capture", shadow),
                ));
                steps.push(PlanStep::new(
                    StepKind::CopyRows,
                    LockLevel::Row,
                    format!("copy rows of {} into {} in key order", table, shadow),
                ));
                if applied.def.has_unique_constraints() {
                    steps.push(PlanStep::new(
                        StepKind::BuildIndexes,
                        LockLevel::None,
                        format!("build unique indexes on {}", shadow),
                    ));
                }
                steps.push(PlanStep::new(
                    StepKind::ApplyLog,
                    LockLevel::Row,
                    "replay captured changes until the backlog converges",
                ));
                steps.push(PlanStep::new(
                    StepKind::Swap,
                    LockLevel::TableExclusive,
                    format!("drain the change log and swap {} into place", shadow),
                ));
                steps.push(PlanStep::new(
                    StepKind::DropRetired,
                    LockLevel::None,
                    format!(
                        "drop {} and the change capture",
                        retired_table_name(table, migration_id)
                    ),
                ));
                applied.transform
            }
            Strategy::InPlace => {
                let changes: Vec<_> = delta.ops.iter().map(|op| op.describe()).collect();
                steps.push(PlanStep::new(
                    StepKind::AlterInPlace,
                    LockLevel::TableExclusive,
                    format!("alter {}: {}", table, changes.join(", ")),
                ));
                RowTransform::identity(applied.def.columns.len())
            }
        };

        if analyze {
            steps.push(PlanStep::new(
                StepKind::Analyze,
                LockLevel::None,
                format!("refresh statistics of {}", table),
            ));
        }

        Ok(MigrationPlan {
            migration_id: migration_id.to_string(),
            table: table.clone(),
            strategy,
            target: applied.def,
            transform,
            rewrites_rows,
            steps,
            estimated_rows: live.stats.map(|s| s.row_count),
        })
    }
}
