//! Host database error types.

use sled::transaction::TransactionError;
use thiserror::Error;

/// Errors raised by the embedded table store and change capture.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Key decoding error.
    #[error("invalid key format")]
    InvalidKey,

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("table already exists: {0}")]
    TableExists(String),

    /// A row does not fit the table definition.
    #[error("invalid row for table {table}: {message}")]
    InvalidRow {
        /// Table the row was written to.
        table: String,
        /// What is wrong with the row.
        message: String,
    },

    /// Insert of a primary key that already exists.
    #[error("duplicate primary key {key} in table {table}")]
    DuplicateKey {
        /// Table name.
        table: String,
        /// Rendered key values.
        key: String,
    },

    #[error("row not found in table {table}")]
    RowNotFound { table: String },

    /// Unique constraint violation.
    #[error("unique constraint {constraint} on {table} violated by value ({value})")]
    UniqueViolation {
        /// Table name.
        table: String,
        /// Constraint name.
        constraint: String,
        /// Rendered duplicate value.
        value: String,
    },

    /// Check constraint violation.
    #[error("check constraint {constraint} on {table} violated by value {value}")]
    CheckViolation {
        /// Table name.
        table: String,
        /// Constraint name.
        constraint: String,
        /// Rendered offending value.
        value: String,
    },

    /// A bounded lock wait expired.
    #[error("timed out after {waited_ms}ms waiting for {mode} lock on {table}")]
    LockTimeout {
        /// Table name.
        table: String,
        /// "shared" or "exclusive".
        mode: &'static str,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// A table already has change capture installed.
    #[error("table {table} already has change capture installed by migration {migration_id}")]
    CaptureConflict {
        /// Table name.
        table: String,
        /// Owner of the existing capture.
        migration_id: String,
    },

    /// The capture for a migration is not running in this process.
    #[error("change capture for migration {0} is not active")]
    CaptureInactive(String),

    /// The catalog changed underneath an atomic operation.
    #[error("catalog conflict: {0}")]
    CatalogConflict(String),

    /// A value could not be converted to the requested column type.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::CatalogConflict(_) | Error::CaptureInactive(_)
        )
    }
}

/// Result alias for host operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unwrap the error of a failed sled transaction.
pub(crate) fn map_tx_error(err: TransactionError<Error>) -> Error {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::Storage(e),
    }
}

/// Encode and decode rkyv types.
///
/// Bytes read back from sled are not guaranteed to be aligned, so decoding
/// copies them into an aligned buffer first.
macro_rules! rkyv_codec {
    ($ty:ty) => {
        impl $ty {
            /// Serialize to bytes.
            pub fn to_bytes(&self) -> $crate::error::Result<Vec<u8>> {
                rkyv::to_bytes::<rkyv::rancor::Error>(self)
                    .map(|v| v.to_vec())
                    .map_err(|e| $crate::error::Error::Serialization(e.to_string()))
            }

            /// Deserialize from bytes.
            pub fn from_bytes(bytes: &[u8]) -> $crate::error::Result<Self> {
                let mut aligned = rkyv::util::AlignedVec::<16>::with_capacity(bytes.len());
                aligned.extend_from_slice(bytes);
                rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
                    .map_err(|e| $crate::error::Error::Deserialization(e.to_string()))
            }
        }
    };
}

pub(crate) use rkyv_codec;
