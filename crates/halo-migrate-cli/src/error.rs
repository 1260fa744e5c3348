//! CLI error type and exit codes.

use halo_migrate_core::{ErrorCategory, MigrateError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Migrate(#[from] MigrateError),

    /// A run stopped on an error; the migration record holds the details.
    #[error("migration {migration_id} stopped: {source}")]
    Stopped {
        migration_id: String,
        #[source]
        source: MigrateError,
    },

    /// The database could not be opened, usually because another process
    /// holds it.
    #[error("cannot open database at {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: halo_migrate_core::Error,
    },

    #[error("{0}")]
    Usage(String),

    #[error("{0}")]
    Runtime(String),
}

impl From<halo_migrate_core::Error> for CliError {
    fn from(err: halo_migrate_core::Error) -> Self {
        CliError::Migrate(err.into())
    }
}

impl CliError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CliError::Migrate(e) | CliError::Stopped { source: e, .. } => e.category(),
            CliError::Open { .. } => ErrorCategory::Transient,
            CliError::Usage(_) => ErrorCategory::User,
            CliError::Runtime(_) => ErrorCategory::Fatal,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.category().exit_code()
    }

    /// Id of the migration the error belongs to, if any.
    pub fn migration_id(&self) -> Option<&str> {
        match self {
            CliError::Stopped { migration_id, .. } => Some(migration_id),
            _ => None,
        }
    }
}
