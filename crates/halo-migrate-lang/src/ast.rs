//! Abstract syntax tree for ALTER TABLE actions.

use crate::span::{Span, Spanned};

/// A parsed `[ALTER TABLE name] action, action, ...` statement.
#[derive(Debug, Clone, PartialEq)]
pub struct AlterStatement {
    /// Table named by an explicit `ALTER TABLE` prefix, if present.
    pub table: Option<Spanned<String>>,
    pub actions: Vec<AlterAction>,
    pub span: Span,
}

/// A single schema change.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterAction {
    AddColumn {
        name: Spanned<String>,
        data_type: Spanned<DataType>,
        not_null: bool,
        default: Option<Spanned<Literal>>,
        span: Span,
    },
    DropColumn {
        name: Spanned<String>,
        span: Span,
    },
    AlterColumnType {
        name: Spanned<String>,
        data_type: Spanned<DataType>,
        span: Span,
    },
    SetNotNull {
        name: Spanned<String>,
        span: Span,
    },
    DropNotNull {
        name: Spanned<String>,
        span: Span,
    },
    SetDefault {
        name: Spanned<String>,
        value: Spanned<Literal>,
        span: Span,
    },
    DropDefault {
        name: Spanned<String>,
        span: Span,
    },
    RenameColumn {
        from: Spanned<String>,
        to: Spanned<String>,
        span: Span,
    },
    AddUnique {
        constraint: Spanned<String>,
        columns: Vec<Spanned<String>>,
        span: Span,
    },
    AddCheck {
        constraint: Spanned<String>,
        column: Spanned<String>,
        op: ComparisonOp,
        value: Spanned<Literal>,
        span: Span,
    },
    DropConstraint {
        constraint: Spanned<String>,
        span: Span,
    },
}

impl AlterAction {
    /// Span of the whole action.
    pub fn span(&self) -> Span {
        match self {
            AlterAction::AddColumn { span, .. }
            | AlterAction::DropColumn { span, .. }
            | AlterAction::AlterColumnType { span, .. }
            | AlterAction::SetNotNull { span, .. }
            | AlterAction::DropNotNull { span, .. }
            | AlterAction::SetDefault { span, .. }
            | AlterAction::DropDefault { span, .. }
            | AlterAction::RenameColumn { span, .. }
            | AlterAction::AddUnique { span, .. }
            | AlterAction::AddCheck { span, .. }
            | AlterAction::DropConstraint { span, .. } => *span,
        }
    }

    /// Short keyword form, for logs and plan output.
    pub fn describe(&self) -> String {
        match self {
            AlterAction::AddColumn {
                name, data_type, ..
            } => format!("add column {} {}", name.value, data_type.value),
            AlterAction::DropColumn { name, .. } => format!("drop column {}", name.value),
            AlterAction::AlterColumnType {
                name, data_type, ..
            } => format!("alter column {} type {}", name.value, data_type.value),
            AlterAction::SetNotNull { name, .. } => format!("set not null on {}", name.value),
            AlterAction::DropNotNull { name, .. } => format!("drop not null on {}", name.value),
            AlterAction::SetDefault { name, .. } => format!("set default on {}", name.value),
            AlterAction::DropDefault { name, .. } => format!("drop default on {}", name.value),
            AlterAction::RenameColumn { from, to, .. } => {
                format!("rename column {} to {}", from.value, to.value)
            }
            AlterAction::AddUnique { constraint, .. } => {
                format!("add unique constraint {}", constraint.value)
            }
            AlterAction::AddCheck { constraint, .. } => {
                format!("add check constraint {}", constraint.value)
            }
            AlterAction::DropConstraint { constraint, .. } => {
                format!("drop constraint {}", constraint.value)
            }
        }
    }
}

/// Column types understood by the grammar. SQL aliases are folded in by the
/// parser (`bigint` is `Int`, `varchar` is `Text`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

impl DataType {
    /// Resolve a type name, accepting common SQL spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        let lowered = name.to_ascii_lowercase();
        let ty = match lowered.as_str() {
            "bool" | "boolean" => DataType::Bool,
            "int" | "integer" | "int2" | "int4" | "int8" | "smallint" | "bigint" => DataType::Int,
            "float" | "float4" | "float8" | "real" | "double" | "numeric" | "decimal" => {
                DataType::Float
            }
            "text" | "varchar" | "string" | "char" => DataType::Text,
            "bytes" | "bytea" | "blob" => DataType::Bytes,
            _ => return None,
        };
        Some(ty)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Text => "text",
            DataType::Bytes => "bytes",
        };
        f.write_str(name)
    }
}

/// Literal values for defaults and check constraints.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

/// Comparison operators allowed in `CHECK (column op literal)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl std::fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::Ne => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
        };
        f.write_str(op)
    }
}
