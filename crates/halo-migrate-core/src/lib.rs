//! halo-migrate core - minimal-lock schema migrations.
//!
//! This crate provides the migration engine and the embedded host database it
//! runs against:
//!
//! - [`storage`] and [`catalog`]: a sled-backed table store with a versioned
//!   catalog, table locks and atomic table swaps.
//! - [`capture`]: change capture on live tables, either written with each
//!   row (trigger) or tailed from the change stream.
//! - [`migration`]: planner, shadow tables, sync, cutover and the persistent
//!   migration state.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod capture;
pub mod catalog;
pub mod error;
pub mod host;
pub mod migration;
pub mod storage;

pub use capture::{CaptureHandle, CaptureKind, ChangeCapture, LogStreamCapture, TriggerCapture};
pub use catalog::{ColumnDef, ColumnType, ConstraintDef, TableDef, Value};
pub use error::Error;
pub use host::HostDatabase;
pub use migration::{
    CancellationToken, ErrorCategory, Executor, MigrateError, MigrationConfig, MigrationRequest,
    MigrationState, MigrationStatus, Phase, Strategy,
};
pub use storage::{Row, StorageConfig, StorageEngine};
