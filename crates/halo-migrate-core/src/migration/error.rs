//! Migration-specific error types.

use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use thiserror::Error;

/// Who has to act on an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// The request is wrong; retrying it unchanged fails again.
    User,
    /// Retry or resume later.
    Transient,
    /// Operator attention required.
    Fatal,
}

impl ErrorCategory {
    /// Process exit code of the CLI for this category.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::User => 2,
            ErrorCategory::Transient => 3,
            ErrorCategory::Fatal => 4,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Fatal => write!(f, "fatal"),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The schema delta cannot be executed.
    #[error("unsupported schema change: {0}")]
    UnsupportedDelta(String),

    /// The target table is missing or unusable.
    #[error("invalid target table {table}: {reason}")]
    InvalidTarget {
        /// Table name.
        table: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The ALTER text did not parse. The message includes the source excerpt.
    #[error("{0}")]
    Parse(String),

    /// Existing or incoming rows violate the new schema.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// A value could not be converted to its new column type.
    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    /// Another migration owns the target table.
    #[error("migration {migration_id} is already active on table {table}")]
    MigrationInProgress {
        /// Table name.
        table: String,
        /// Owner of the claim.
        migration_id: String,
    },

    #[error("migration not found: {0}")]
    MigrationNotFound(String),

    /// Migration ids name tables and trees, so they are restricted.
    #[error("invalid migration id {0:?}: use 1 to 32 letters, digits or underscores")]
    InvalidId(String),

    /// The requested action is not allowed in the migration's current state.
    #[error("cannot {action} migration {migration_id}: {reason}")]
    InvalidTransition {
        /// Migration ID.
        migration_id: String,
        /// Requested action.
        action: &'static str,
        /// Why it is refused.
        reason: String,
    },

    /// Creating the shadow table or the capture failed; nothing is left behind.
    #[error("shadow setup failed: {0}")]
    ShadowSetup(String),

    /// The change log did not converge before the sync deadline.
    #[error("sync did not converge within {waited_ms}ms, backlog {backlog}")]
    SyncStalled {
        /// Entries left at the deadline.
        backlog: u64,
        /// Time spent syncing in this run.
        waited_ms: u64,
    },

    /// The cutover gave up; the live table is unchanged.
    #[error("cutover aborted: {0}")]
    CutoverTimeout(String),

    /// A bounded lock wait expired.
    #[error("timed out after {waited_ms}ms waiting for lock on {table}")]
    LockTimeout {
        /// Table name.
        table: String,
        /// How long the wait lasted.
        waited_ms: u64,
    },

    /// Stopped at a batch boundary on request.
    #[error("migration cancelled")]
    Cancelled,

    /// The shadow table no longer matches the migration's records.
    #[error("shadow table corrupted: {0}")]
    ShadowCorrupted(String),

    #[error("state store unavailable: {0}")]
    StateStoreUnavailable(String),

    /// A stored migration record cannot be decoded.
    #[error("migration state corrupted: {0}")]
    StateCorrupted(String),

    /// The stored record is newer than the one being saved.
    #[error("migration {0} was modified concurrently")]
    StateConflict(String),

    /// Host database error.
    #[error("host error: {0}")]
    Storage(#[source] Error),
}

impl MigrateError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrateError::UnsupportedDelta(_)
            | MigrateError::InvalidTarget { .. }
            | MigrateError::Parse(_)
            | MigrateError::ConstraintViolation(_)
            | MigrateError::ConversionFailed(_)
            | MigrateError::MigrationInProgress { .. }
            | MigrateError::MigrationNotFound(_)
            | MigrateError::InvalidId(_)
            | MigrateError::InvalidTransition { .. } => ErrorCategory::User,
            MigrateError::ShadowSetup(_)
            | MigrateError::SyncStalled { .. }
            | MigrateError::CutoverTimeout(_)
            | MigrateError::LockTimeout { .. }
            | MigrateError::Cancelled => ErrorCategory::Transient,
            MigrateError::Storage(e) if e.is_transient() => ErrorCategory::Transient,
            MigrateError::ShadowCorrupted(_)
            | MigrateError::StateStoreUnavailable(_)
            | MigrateError::StateCorrupted(_)
            | MigrateError::StateConflict(_)
            | MigrateError::Storage(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether the migration can be resumed after this error.
    pub fn is_resumable(&self) -> bool {
        self.category() == ErrorCategory::Transient
            && !matches!(self, MigrateError::ShadowSetup(_))
    }

    /// Whether this error, raised before the swap, means the migration can
    /// never finish as requested. Such migrations are torn down.
    pub fn aborts_migration(&self) -> bool {
        matches!(
            self,
            MigrateError::ConstraintViolation(_)
                | MigrateError::ConversionFailed(_)
                | MigrateError::InvalidTarget { .. }
                | MigrateError::UnsupportedDelta(_)
        )
    }
}

impl From<Error> for MigrateError {
    fn from(err: Error) -> Self {
        match err {
            Error::LockTimeout {
                table, waited_ms, ..
            } => MigrateError::LockTimeout { table, waited_ms },
            Error::UniqueViolation { .. } | Error::CheckViolation { .. } | Error::InvalidRow { .. } => {
                MigrateError::ConstraintViolation(err.to_string())
            }
            Error::Conversion(message) => MigrateError::ConversionFailed(message),
            other => MigrateError::Storage(other),
        }
    }
}

impl From<halo_migrate_lang::ParseError> for MigrateError {
    fn from(err: halo_migrate_lang::ParseError) -> Self {
        MigrateError::Parse(err.to_string())
    }
}

/// Result alias for migration operations.
pub type Result<T, E = MigrateError> = std::result::Result<T, E>;
