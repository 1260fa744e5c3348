//! Minimal-lock schema migrations.
//!
//! A migration changes one live table while the application keeps writing to
//! it:
//!
//! - The planner validates the schema delta and picks a strategy. Deltas
//!   that rewrite rows use a shadow table; metadata-only deltas alter the
//!   catalog entry in place.
//! - The shadow manager creates the shadow table and installs change capture
//!   on the live table under one brief exclusive lock.
//! - The sync engine copies rows in key order, then replays the change log
//!   until the backlog converges.
//! - The cutover coordinator drains the rest under the exclusive lock and
//!   swaps the shadow into place.
//!
//! Every step is saved in the [`MigrationStateStore`], so a crashed or paused
//! migration resumes where it stopped.
//!
//! # Example
//!
//! ```ignore
//! use halo_migrate_core::migration::{CancellationToken, Executor, MigrationConfig, MigrationRequest};
//!
//! let executor = Executor::open(engine, MigrationConfig::default())?;
//! let state = executor.start(MigrationRequest::new(
//!     "accounts",
//!     "ADD COLUMN score int NOT NULL DEFAULT 0",
//! ))?;
//! executor.run(&state.migration_id, &CancellationToken::new())?;
//! ```

pub mod cancel;
pub mod config;
pub mod cutover;
pub mod delta;
pub mod error;
pub mod executor;
pub mod planner;
pub mod shadow;
pub mod spec;
pub mod state;
pub mod sync;

pub use cancel::CancellationToken;
pub use config::{CutoverConfig, MigrationConfig, SyncConfig};
pub use cutover::CutoverCoordinator;
pub use delta::{apply_delta, AppliedDelta, ColumnSource, RowTransform};
pub use error::{ErrorCategory, MigrateError};
pub use executor::{generate_migration_id, validate_migration_id, Executor};
pub use planner::{LockLevel, MigrationPlan, PlanStep, Planner, StepKind};
pub use shadow::{retired_table_name, shadow_table_name, ShadowManager};
pub use spec::{DeltaOp, MigrationRequest, MigrationSpec, SchemaDelta, Strategy};
pub use state::{
    CopyProgress, CutoverState, ErrorRecord, MigrationState, MigrationStateStore, MigrationStatus,
    Phase, PhaseTransition, ShadowRef,
};
pub use sync::SyncEngine;
