//! Embedded sled-backed host database.
//!
//! Each table's rows live in their own tree keyed by the encoded primary key,
//! next to a tree of unique index entries. Trees are named after the table's
//! storage id, so renames and swaps only touch the catalog.

mod config;
mod engine;
mod lock;
mod row;

pub mod key;

pub use config::StorageConfig;
pub use engine::StorageEngine;
pub use lock::{ExclusiveGuard, SharedGuard, TableLock, TableLockManager};
pub use row::Row;
