//! Table, column and constraint definitions.

use super::types::{CheckOp, ColumnType, Value};
use crate::error::{rkyv_codec, Error, Result};
use crate::storage::key::encode_key;
use crate::storage::Row;
use rkyv::{Archive, Deserialize, Serialize};

/// Definition of a column.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    /// Value used to fill the column when it is added to existing rows.
    pub default: Option<Value>,
}

impl ColumnDef {
    /// A nullable column without default.
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Table constraint.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ConstraintDef {
    /// Values of `columns` must be unique among rows where none is null.
    Unique { name: String, columns: Vec<String> },
    /// `column op value` must hold for every row.
    Check {
        name: String,
        column: String,
        op: CheckOp,
        value: Value,
    },
}

impl ConstraintDef {
    pub fn name(&self) -> &str {
        match self {
            ConstraintDef::Unique { name, .. } | ConstraintDef::Check { name, .. } => name,
        }
    }

    /// Columns the constraint reads.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            ConstraintDef::Unique { columns, .. } => columns.iter().map(String::as_str).collect(),
            ConstraintDef::Check { column, .. } => vec![column.as_str()],
        }
    }

    /// Copy of the constraint with a column reference renamed.
    pub fn rename_column(&self, from: &str, to: &str) -> ConstraintDef {
        let rename = |c: &String| if c == from { to.to_string() } else { c.clone() };
        match self {
            ConstraintDef::Unique { name, columns } => ConstraintDef::Unique {
                name: name.clone(),
                columns: columns.iter().map(rename).collect(),
            },
            ConstraintDef::Check {
                name,
                column,
                op,
                value,
            } => ConstraintDef::Check {
                name: name.clone(),
                column: rename(column),
                op: *op,
                value: value.clone(),
            },
        }
    }
}

/// Change capture installed on a table. While present, every committed write
/// to the table also appends a change-log entry to `log_tree` in the same
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct CaptureBinding {
    /// Migration that owns the capture.
    pub migration_id: String,
    /// Sled tree receiving the log entries.
    pub log_tree: String,
}

/// Statistics refreshed by analyze.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct TableStats {
    pub row_count: u64,
    /// Microseconds since the Unix epoch.
    pub analyzed_at: u64,
}

/// Catalog entry for a table.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    /// Identifies the sled trees holding the rows and unique indexes. Stays
    /// with the data across renames and swaps.
    pub storage_id: u64,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub constraints: Vec<ConstraintDef>,
    /// Bumped on every catalog change to this table.
    pub version: u64,
    /// Whether unique indexes are built and maintained on write.
    pub indexes_ready: bool,
    pub capture: Option<CaptureBinding>,
    pub stats: Option<TableStats>,
}

rkyv_codec!(TableDef);

impl TableDef {
    /// A new table definition. Storage id and version are assigned when the
    /// table is created.
    pub fn new(
        name: impl Into<String>,
        columns: Vec<ColumnDef>,
        primary_key: Vec<impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            storage_id: 0,
            columns,
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            constraints: Vec::new(),
            version: 0,
            indexes_ready: true,
            capture: None,
            stats: None,
        }
    }

    pub fn with_constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn constraint(&self, name: &str) -> Option<&ConstraintDef> {
        self.constraints.iter().find(|c| c.name() == name)
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|c| c == column)
    }

    /// Check the definition is well formed.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Error::InvalidData(format!("table {}: {}", self.name, message));

        if !is_valid_identifier(&self.name) {
            return Err(invalid("invalid table name".to_string()));
        }
        if self.columns.is_empty() {
            return Err(invalid("no columns".to_string()));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == column.name) {
                return Err(invalid(format!("duplicate column {}", column.name)));
            }
            if let Some(default) = &column.default {
                if !default.fits(column.ty) {
                    return Err(invalid(format!(
                        "default {} does not fit column {} of type {}",
                        default, column.name, column.ty
                    )));
                }
            }
        }
        if self.primary_key.is_empty() {
            return Err(invalid("no primary key".to_string()));
        }
        for pk in &self.primary_key {
            match self.column(pk) {
                Some(c) if !c.nullable => {}
                Some(_) => return Err(invalid(format!("primary key column {} is nullable", pk))),
                None => return Err(invalid(format!("unknown primary key column {}", pk))),
            }
        }
        for (i, constraint) in self.constraints.iter().enumerate() {
            if self.constraints[..i]
                .iter()
                .any(|c| c.name() == constraint.name())
            {
                return Err(invalid(format!("duplicate constraint {}", constraint.name())));
            }
            for column in constraint.columns() {
                if self.column(column).is_none() {
                    return Err(invalid(format!(
                        "constraint {} references unknown column {}",
                        constraint.name(),
                        column
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check a row against column types, nullability and check constraints.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        if row.values.len() != self.columns.len() {
            return Err(Error::InvalidRow {
                table: self.name.clone(),
                message: format!(
                    "expected {} values, got {}",
                    self.columns.len(),
                    row.values.len()
                ),
            });
        }
        for (column, value) in self.columns.iter().zip(&row.values) {
            if value.is_null() && !column.nullable {
                return Err(Error::InvalidRow {
                    table: self.name.clone(),
                    message: format!("null value in column {} violates not-null", column.name),
                });
            }
            if !value.fits(column.ty) {
                return Err(Error::InvalidRow {
                    table: self.name.clone(),
                    message: format!(
                        "value {} does not fit column {} of type {}",
                        value, column.name, column.ty
                    ),
                });
            }
        }
        for constraint in &self.constraints {
            if let ConstraintDef::Check {
                name,
                column,
                op,
                value,
            } = constraint
            {
                let idx = self.column_index(column).ok_or_else(|| {
                    Error::InvalidData(format!("check {} references unknown column", name))
                })?;
                let actual = &row.values[idx];
                if !op.holds(actual, value) {
                    return Err(Error::CheckViolation {
                        table: self.name.clone(),
                        constraint: name.clone(),
                        value: actual.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Primary key values of a row, in key order.
    pub fn key_values<'a>(&self, row: &'a Row) -> Result<Vec<&'a Value>> {
        self.primary_key
            .iter()
            .map(|pk| {
                self.column_index(pk)
                    .and_then(|i| row.values.get(i))
                    .ok_or(Error::InvalidKey)
            })
            .collect()
    }

    /// Encoded primary key of a row.
    pub fn key_of(&self, row: &Row) -> Result<Vec<u8>> {
        let values: Vec<Value> = self.key_values(row)?.into_iter().cloned().collect();
        self.encode_key(&values)
    }

    /// Encode primary key values given in key order.
    pub fn encode_key(&self, values: &[Value]) -> Result<Vec<u8>> {
        if values.len() != self.primary_key.len() || values.iter().any(Value::is_null) {
            return Err(Error::InvalidKey);
        }
        Ok(encode_key(values))
    }

    /// Values of the columns of a unique constraint, `None` if any is null.
    pub fn unique_values(&self, columns: &[String], row: &Row) -> Option<Vec<Value>> {
        let mut values = Vec::with_capacity(columns.len());
        for column in columns {
            let value = row.values.get(self.column_index(column)?)?;
            if value.is_null() {
                return None;
            }
            values.push(value.clone());
        }
        Some(values)
    }

    /// Whether any unique constraint exists.
    pub fn has_unique_constraints(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| matches!(c, ConstraintDef::Unique { .. }))
    }
}

/// Table and column names: ASCII letters, digits and underscores, not
/// starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
