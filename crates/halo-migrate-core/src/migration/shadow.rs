//! Shadow table lifecycle.
//!
//! The shadow table and the live table's change capture are created together
//! under the live table's exclusive lock, and removed together when the
//! migration is aborted.

use super::delta::RowTransform;
use super::error::{MigrateError, Result};
use super::state::{MigrationState, ShadowRef};
use crate::capture::{log_tree_name, CaptureHandle};
use crate::catalog::TableDef;
use crate::host::HostDatabase;
use std::time::Duration;

const MAX_IDENTIFIER: usize = 63;

/// `prefix + table + suffix`, shortening the table part to stay a valid
/// identifier.
fn bounded_name(prefix: &str, table: &str, suffix: &str) -> String {
    let room = MAX_IDENTIFIER.saturating_sub(prefix.len() + suffix.len());
    let table = table.get(..room.min(table.len())).unwrap_or(table);
    format!("{}{}{}", prefix, table, suffix)
}

/// Name of the shadow table of `table` for a migration.
pub fn shadow_table_name(table: &str, migration_id: &str) -> String {
    bounded_name("_migrate_", table, &format!("_{}", migration_id))
}

/// Name the live table is renamed to at cutover.
pub fn retired_table_name(table: &str, migration_id: &str) -> String {
    bounded_name("", table, &format!("_pre_migrate_{}", migration_id))
}

/// Whether `name` belongs to a migration rather than the application.
pub fn is_migration_table(name: &str) -> bool {
    name.starts_with("_migrate_") || name.contains("_pre_migrate_")
}

/// Creates and discards shadow tables.
pub struct ShadowManager<'a> {
    host: &'a dyn HostDatabase,
    lock_timeout: Duration,
}

impl<'a> ShadowManager<'a> {
    pub fn new(host: &'a dyn HostDatabase, lock_timeout: Duration) -> Self {
        Self { host, lock_timeout }
    }

    /// Create the shadow table with the planned target definition and
    /// install the change capture on the live table.
    ///
    /// Runs under the live table's exclusive lock, so no write commits between
    /// the capture starting and the copy's view of the table. On failure
    /// everything created here is removed again.
    pub fn setup(
        &self,
        state: &MigrationState,
        transform: RowTransform,
    ) -> Result<(ShadowRef, CaptureHandle)> {
        let table = state.table();
        let migration_id = &state.migration_id;
        let _guard = self.host.lock_exclusive(table, self.lock_timeout)?;

        let live = self.host.describe(table)?;
        if live.version != state.spec.base_version {
            return Err(MigrateError::InvalidTarget {
                table: table.to_string(),
                reason: format!(
                    "changed since planning (version {} != {})",
                    live.version, state.spec.base_version
                ),
            });
        }

        let capture = self.host.change_capture(state.spec.capture);
        let handle = capture.install(&live, migration_id)?;

        let mut shadow_def: TableDef = state.target.clone();
        shadow_def.name = shadow_table_name(table, migration_id);
        let created = match self
            .host
            .create_shadow(table, live.version, shadow_def, handle.binding())
        {
            Ok(created) => created,
            Err(e) => {
                if let Err(cleanup) = capture.uninstall(&handle) {
                    tracing::warn!(migration_id = %migration_id, error = %cleanup, "failed to remove capture");
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            migration_id = %migration_id,
            table = %table,
            shadow = %created.name,
            capture = %handle.kind,
            "shadow table created"
        );
        Ok((
            ShadowRef {
                table: created.name,
                storage_id: created.storage_id,
                transform,
            },
            handle,
        ))
    }

    /// Remove the capture and shadow table of a migration that has not been
    /// swapped. Works from partial records left by a crash during setup.
    pub fn discard(&self, state: &MigrationState) -> Result<()> {
        let table = state.table();
        let migration_id = &state.migration_id;
        let handle = match &state.capture {
            Some(handle) => handle.clone(),
            None => CaptureHandle {
                kind: state.spec.capture,
                migration_id: migration_id.clone(),
                table: table.to_string(),
                storage_id: 0,
                log_tree: log_tree_name(migration_id),
            },
        };
        self.host.change_capture(handle.kind).uninstall(&handle)?;

        let shadow = state
            .shadow
            .as_ref()
            .map(|s| s.table.clone())
            .unwrap_or_else(|| shadow_table_name(table, migration_id));
        if self.host.drop_table(&shadow)? {
            tracing::info!(migration_id = %migration_id, shadow = %shadow, "shadow table dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(shadow_table_name("accounts", "ab12"), "_migrate_accounts_ab12");
        assert_eq!(retired_table_name("accounts", "ab12"), "accounts_pre_migrate_ab12");
        assert!(is_migration_table("_migrate_accounts_ab12"));
        assert!(is_migration_table("accounts_pre_migrate_ab12"));
        assert!(!is_migration_table("accounts"));

        let long = "t".repeat(63);
        let shadow = shadow_table_name(&long, "ab12");
        assert_eq!(shadow.len(), 63);
        assert!(shadow.ends_with("_ab12"));
        assert!(crate::catalog::is_valid_identifier(&retired_table_name(&long, "ab12")));
    }
}
