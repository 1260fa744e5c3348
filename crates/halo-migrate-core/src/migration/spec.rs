//! Migration requests and schema deltas.

use super::error::{MigrateError, Result};
use crate::capture::CaptureKind;
use crate::catalog::{ColumnDef, ColumnType, ConstraintDef, Value};
use halo_migrate_lang::{AlterAction, AlterStatement, Literal};
use rkyv::{Archive, Deserialize, Serialize};

/// How the schema change is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum Strategy {
    /// Build a shadow table, sync it and swap it in.
    Copy,
    /// Change the catalog entry under a brief exclusive lock.
    InPlace,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Copy => write!(f, "copy"),
            Strategy::InPlace => write!(f, "in-place"),
        }
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "copy" => Ok(Strategy::Copy),
            "in-place" | "inplace" | "in_place" => Ok(Strategy::InPlace),
            other => Err(format!("unknown strategy: {}", other)),
        }
    }
}

/// One schema change operation.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum DeltaOp {
    AddColumn { column: ColumnDef },
    DropColumn { name: String },
    AlterColumnType { name: String, ty: ColumnType },
    SetNotNull { name: String },
    DropNotNull { name: String },
    SetDefault { name: String, value: Value },
    DropDefault { name: String },
    RenameColumn { from: String, to: String },
    AddConstraint { constraint: ConstraintDef },
    DropConstraint { name: String },
}

impl DeltaOp {
    /// Whether existing rows must be rewritten or revalidated.
    pub fn rewrites_rows(&self) -> bool {
        match self {
            DeltaOp::AddColumn { .. }
            | DeltaOp::DropColumn { .. }
            | DeltaOp::AlterColumnType { .. }
            | DeltaOp::SetNotNull { .. }
            | DeltaOp::AddConstraint { .. } => true,
            DeltaOp::DropNotNull { .. }
            | DeltaOp::SetDefault { .. }
            | DeltaOp::DropDefault { .. }
            | DeltaOp::RenameColumn { .. }
            | DeltaOp::DropConstraint { .. } => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            DeltaOp::AddColumn { column } => {
                let mut text = format!("add column {} {}", column.name, column.ty);
                if !column.nullable {
                    text.push_str(" not null");
                }
                if let Some(default) = &column.default {
                    text.push_str(&format!(" default {}", default));
                }
                text
            }
            DeltaOp::DropColumn { name } => format!("drop column {}", name),
            DeltaOp::AlterColumnType { name, ty } => format!("alter column {} type {}", name, ty),
            DeltaOp::SetNotNull { name } => format!("alter column {} set not null", name),
            DeltaOp::DropNotNull { name } => format!("alter column {} drop not null", name),
            DeltaOp::SetDefault { name, value } => {
                format!("alter column {} set default {}", name, value)
            }
            DeltaOp::DropDefault { name } => format!("alter column {} drop default", name),
            DeltaOp::RenameColumn { from, to } => format!("rename column {} to {}", from, to),
            DeltaOp::AddConstraint { constraint } => match constraint {
                ConstraintDef::Unique { name, columns } => {
                    format!("add constraint {} unique ({})", name, columns.join(", "))
                }
                ConstraintDef::Check {
                    name,
                    column,
                    op,
                    value,
                } => format!("add constraint {} check ({} {} {})", name, column, op, value),
            },
            DeltaOp::DropConstraint { name } => format!("drop constraint {}", name),
        }
    }
}

impl From<&AlterAction> for DeltaOp {
    fn from(action: &AlterAction) -> Self {
        match action {
            AlterAction::AddColumn {
                name,
                data_type,
                not_null,
                default,
                ..
            } => DeltaOp::AddColumn {
                column: ColumnDef {
                    name: name.value.clone(),
                    ty: data_type.value.into(),
                    nullable: !not_null,
                    default: default
                        .as_ref()
                        .filter(|literal| literal.value != Literal::Null)
                        .map(|literal| Value::from(&literal.value)),
                },
            },
            AlterAction::DropColumn { name, .. } => DeltaOp::DropColumn {
                name: name.value.clone(),
            },
            AlterAction::AlterColumnType {
                name, data_type, ..
            } => DeltaOp::AlterColumnType {
                name: name.value.clone(),
                ty: data_type.value.into(),
            },
            AlterAction::SetNotNull { name, .. } => DeltaOp::SetNotNull {
                name: name.value.clone(),
            },
            AlterAction::DropNotNull { name, .. } => DeltaOp::DropNotNull {
                name: name.value.clone(),
            },
            AlterAction::SetDefault { name, value, .. } => DeltaOp::SetDefault {
                name: name.value.clone(),
                value: Value::from(&value.value),
            },
            AlterAction::DropDefault { name, .. } => DeltaOp::DropDefault {
                name: name.value.clone(),
            },
            AlterAction::RenameColumn { from, to, .. } => DeltaOp::RenameColumn {
                from: from.value.clone(),
                to: to.value.clone(),
            },
            AlterAction::AddUnique {
                constraint,
                columns,
                ..
            } => DeltaOp::AddConstraint {
                constraint: ConstraintDef::Unique {
                    name: constraint.value.clone(),
                    columns: columns.iter().map(|c| c.value.clone()).collect(),
                },
            },
            AlterAction::AddCheck {
                constraint,
                column,
                op,
                value,
                ..
            } => DeltaOp::AddConstraint {
                constraint: ConstraintDef::Check {
                    name: constraint.value.clone(),
                    column: column.value.clone(),
                    op: (*op).into(),
                    value: Value::from(&value.value),
                },
            },
            AlterAction::DropConstraint { constraint, .. } => DeltaOp::DropConstraint {
                name: constraint.value.clone(),
            },
        }
    }
}

/// Ordered list of schema change operations.
#[derive(Debug, Clone, PartialEq, Default, Archive, Serialize, Deserialize)]
pub struct SchemaDelta {
    pub ops: Vec<DeltaOp>,
}

impl SchemaDelta {
    pub fn new(ops: Vec<DeltaOp>) -> Self {
        Self { ops }
    }

    /// Parse ALTER text. Returns the table named by an `ALTER TABLE` prefix,
    /// if any, with the delta.
    pub fn parse(text: &str) -> Result<(Option<String>, SchemaDelta)> {
        let statement =
            halo_migrate_lang::parse(text).map_err(|e| MigrateError::Parse(e.format_with_source(text)))?;
        Ok((
            statement.table.as_ref().map(|t| t.value.clone()),
            SchemaDelta::from(&statement),
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn rewrites_rows(&self) -> bool {
        self.ops.iter().any(DeltaOp::rewrites_rows)
    }
}

impl From<&AlterStatement> for SchemaDelta {
    fn from(statement: &AlterStatement) -> Self {
        Self {
            ops: statement.actions.iter().map(DeltaOp::from).collect(),
        }
    }
}

/// What a migration does. Fixed once the shadow table exists.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct MigrationSpec {
    pub migration_id: String,
    /// Live table being changed.
    pub table: String,
    pub delta: SchemaDelta,
    /// ALTER text as given by the operator.
    pub alter_text: String,
    pub strategy: Strategy,
    pub capture: CaptureKind,
    /// Catalog version of the live table the delta was planned against.
    pub base_version: u64,
}

/// Input of [`Executor::start`](super::Executor::start).
#[derive(Debug, Clone)]
pub struct MigrationRequest {
    pub table: String,
    pub alter: String,
    /// Generated when absent.
    pub migration_id: Option<String>,
    /// Chosen by the planner when absent.
    pub strategy: Option<Strategy>,
    /// Executor default when absent.
    pub capture: Option<CaptureKind>,
}

impl MigrationRequest {
    pub fn new(table: impl Into<String>, alter: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alter: alter.into(),
            migration_id: None,
            strategy: None,
            capture: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.migration_id = Some(id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_capture(mut self, capture: CaptureKind) -> Self {
        self.capture = Some(capture);
        self
    }
}
