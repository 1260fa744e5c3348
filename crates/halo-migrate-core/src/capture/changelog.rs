//! Persisted change log of one migration.

use crate::error::{rkyv_codec, Error, Result};
use crate::storage::Row;
use rkyv::{Archive, Deserialize, Serialize};
use sled::{Batch, Db, Tree};

/// A captured row change.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ChangeOp {
    /// Row inserted or updated; `row` is the full new image.
    Upsert { key: Vec<u8>, row: Row },
    /// Row deleted.
    Delete { key: Vec<u8> },
}

impl ChangeOp {
    pub fn key(&self) -> &[u8] {
        match self {
            ChangeOp::Upsert { key, .. } | ChangeOp::Delete { key } => key,
        }
    }
}

/// One entry of a change log, keyed by its LSN.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub lsn: u64,
    pub op: ChangeOp,
    /// Commit time in microseconds since the Unix epoch.
    pub committed_at: u64,
}

rkyv_codec!(ChangeLogEntry);

/// Log tree name for a migration.
pub fn log_tree_name(migration_id: &str) -> String {
    format!("capture:{}", migration_id)
}

/// LSN-ordered view over a change log tree.
#[derive(Clone)]
pub struct ChangeLog {
    tree: Tree,
}

impl ChangeLog {
    pub fn open(db: &Db, name: &str) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(name)?,
        })
    }

    pub fn append(&self, entry: &ChangeLogEntry) -> Result<()> {
        self.tree.insert(entry.lsn.to_be_bytes(), entry.to_bytes()?)?;
        Ok(())
    }

    /// Up to `limit` entries with an LSN greater than `after`, in LSN order.
    pub fn peek(&self, after: u64, limit: usize) -> Result<Vec<ChangeLogEntry>> {
        let Some(start) = after.checked_add(1) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::with_capacity(limit.min(1024));
        for item in self.tree.range(start.to_be_bytes()..).take(limit) {
            let (_, value) = item?;
            entries.push(ChangeLogEntry::from_bytes(&value)?);
        }
        Ok(entries)
    }

    /// Remove every entry with an LSN up to and including `up_to`.
    pub fn purge(&self, up_to: u64) -> Result<usize> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for item in self.tree.range(..=up_to.to_be_bytes()) {
            let (key, _) = item?;
            batch.remove(key);
            removed += 1;
        }
        if removed > 0 {
            self.tree.apply_batch(batch)?;
        }
        Ok(removed)
    }

    /// Number of entries with an LSN greater than `after`.
    pub fn backlog(&self, after: u64) -> Result<u64> {
        let Some(start) = after.checked_add(1) else {
            return Ok(0);
        };
        let mut count = 0;
        for item in self.tree.range(start.to_be_bytes()..) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Highest LSN in the log, 0 when empty.
    pub fn high_water(&self) -> Result<u64> {
        match self.tree.last()? {
            Some((key, _)) => decode_lsn(&key),
            None => Ok(0),
        }
    }
}

fn decode_lsn(key: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = key.try_into().map_err(|_| Error::InvalidKey)?;
    Ok(u64::from_be_bytes(raw))
}
