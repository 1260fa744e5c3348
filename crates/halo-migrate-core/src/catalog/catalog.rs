//! Catalog tree and its atomic operations.

use super::table::{CaptureBinding, TableDef};
use crate::error::{map_tx_error, Error, Result};
use sled::transaction::{ConflictableTransactionError, TransactionalTree};
use sled::{Db, Tree};

/// Tree name for table definitions.
const CATALOG_TREE: &str = "catalog:tables";

/// Table definitions keyed by table name.
#[derive(Clone)]
pub struct Catalog {
    tree: Tree,
}

impl Catalog {
    /// Open or create the catalog.
    pub fn open(db: &Db) -> Result<Self> {
        let tree = db.open_tree(CATALOG_TREE)?;
        Ok(Self { tree })
    }

    pub fn get(&self, name: &str) -> Result<Option<TableDef>> {
        match self.tree.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(TableDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All table definitions, ordered by name.
    pub fn list(&self) -> Result<Vec<TableDef>> {
        let mut tables = Vec::new();
        for result in self.tree.iter() {
            let (_, value) = result?;
            tables.push(TableDef::from_bytes(&value)?);
        }
        Ok(tables)
    }

    /// Insert a definition under a name that must not exist yet.
    pub fn insert_new(&self, def: &TableDef) -> Result<()> {
        let bytes = def.to_bytes()?;
        match self
            .tree
            .compare_and_swap(def.name.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::TableExists(def.name.clone())),
        }
    }

    pub fn remove(&self, name: &str) -> Result<Option<TableDef>> {
        match self.tree.remove(name.as_bytes())? {
            Some(bytes) => Ok(Some(TableDef::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Apply `change` to a table definition and bump its version, failing if
    /// the stored version is no longer `expected_version`.
    pub fn update<F>(&self, name: &str, expected_version: Option<u64>, change: F) -> Result<TableDef>
    where
        F: Fn(&mut TableDef) -> Result<()>,
    {
        self.tree
            .transaction(|tx| {
                let mut def = load(tx, name)?;
                check_version(&def, expected_version)?;
                change(&mut def).map_err(ConflictableTransactionError::Abort)?;
                def.version += 1;
                store(tx, name, &def)?;
                Ok(def)
            })
            .map_err(map_tx_error)
    }

    /// Create `shadow` and bind change capture to `live` in one transaction.
    ///
    /// Fails if `live` changed since `expected_version` or already has a
    /// capture installed.
    pub fn create_shadow(
        &self,
        live: &str,
        expected_version: u64,
        shadow: &TableDef,
        binding: Option<&CaptureBinding>,
    ) -> Result<TableDef> {
        self.tree
            .transaction(|tx| {
                let mut live_def = load(tx, live)?;
                check_version(&live_def, Some(expected_version))?;
                if let Some(existing) = &live_def.capture {
                    return Err(ConflictableTransactionError::Abort(Error::CaptureConflict {
                        table: live.to_string(),
                        migration_id: existing.migration_id.clone(),
                    }));
                }
                if tx.get(shadow.name.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(Error::TableExists(
                        shadow.name.clone(),
                    )));
                }

                store(tx, &shadow.name, shadow)?;
                if let Some(binding) = binding {
                    live_def.capture = Some(binding.clone());
                    live_def.version += 1;
                    store(tx, live, &live_def)?;
                }
                Ok(live_def)
            })
            .map_err(map_tx_error)
    }

    /// Make `shadow` the table named `live`, keeping the old live table as
    /// `retired`. All three names change in one transaction.
    pub fn swap(&self, live: &str, shadow: &str, retired: &str) -> Result<TableDef> {
        self.tree
            .transaction(|tx| {
                let live_def = load(tx, live)?;
                let shadow_def = load(tx, shadow)?;
                if tx.get(retired.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(Error::TableExists(
                        retired.to_string(),
                    )));
                }

                let mut retired_def = live_def.clone();
                retired_def.name = retired.to_string();
                retired_def.capture = None;
                retired_def.version += 1;

                let mut promoted = shadow_def;
                promoted.name = live.to_string();
                promoted.capture = None;
                promoted.version = live_def.version + 1;

                tx.remove(shadow.as_bytes())?;
                store(tx, retired, &retired_def)?;
                store(tx, live, &promoted)?;
                Ok(promoted)
            })
            .map_err(map_tx_error)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

fn load(tx: &TransactionalTree, name: &str) -> Result<TableDef, ConflictableTransactionError<Error>> {
    match tx.get(name.as_bytes())? {
        Some(bytes) => TableDef::from_bytes(&bytes).map_err(ConflictableTransactionError::Abort),
        None => Err(ConflictableTransactionError::Abort(Error::TableNotFound(
            name.to_string(),
        ))),
    }
}

fn store(
    tx: &TransactionalTree,
    name: &str,
    def: &TableDef,
) -> Result<(), ConflictableTransactionError<Error>> {
    let bytes = def.to_bytes().map_err(ConflictableTransactionError::Abort)?;
    tx.insert(name.as_bytes(), bytes)?;
    Ok(())
}

fn check_version(
    def: &TableDef,
    expected: Option<u64>,
) -> Result<(), ConflictableTransactionError<Error>> {
    match expected {
        Some(version) if version != def.version => {
            Err(ConflictableTransactionError::Abort(Error::CatalogConflict(format!(
                "table {} is at version {}, expected {}",
                def.name, def.version, version
            ))))
        }
        _ => Ok(()),
    }
}
