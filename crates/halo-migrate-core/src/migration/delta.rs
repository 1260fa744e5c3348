//! Applying a schema delta to a table definition.
//!
//! [`apply_delta`] validates the delta against the live definition and returns
//! the target definition together with the [`RowTransform`] that turns a live
//! row into a row of the target schema.

use super::error::{MigrateError, Result};
use super::spec::{DeltaOp, SchemaDelta};
use crate::catalog::{is_valid_identifier, ColumnDef, ColumnType, ConstraintDef, TableDef, Value};
use crate::storage::Row;
use rkyv::{Archive, Deserialize, Serialize};

/// Where a target column's value comes from.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum ColumnSource {
    /// Value of the live column at `index`, converted if `convert_to` is set.
    Source {
        index: usize,
        convert_to: Option<ColumnType>,
    },
    /// Same value for every row.
    Constant(Value),
}

/// Maps live rows to rows of the target schema, one source per target column.
#[derive(Debug, Clone, PartialEq, Default, Archive, Serialize, Deserialize)]
pub struct RowTransform {
    pub sources: Vec<ColumnSource>,
}

impl RowTransform {
    /// The identity transform for `width` columns.
    pub fn identity(width: usize) -> Self {
        Self {
            sources: (0..width)
                .map(|index| ColumnSource::Source {
                    index,
                    convert_to: None,
                })
                .collect(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.sources.iter().enumerate().all(|(i, source)| {
            matches!(source, ColumnSource::Source { index, convert_to: None } if *index == i)
        })
    }

    pub fn apply(&self, row: &Row) -> Result<Row> {
        let mut values = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let value = match source {
                ColumnSource::Source { index, convert_to } => {
                    let value = row.get(*index).ok_or_else(|| {
                        MigrateError::ShadowCorrupted(format!(
                            "live row has {} values, column {} expected",
                            row.values.len(),
                            index
                        ))
                    })?;
                    match convert_to {
                        Some(ty) => value.convert(*ty)?,
                        None => value.clone(),
                    }
                }
                ColumnSource::Constant(value) => value.clone(),
            };
            values.push(value);
        }
        Ok(Row::new(values))
    }
}

/// Result of applying a delta.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedDelta {
    /// Target definition. Keeps the live table's name and storage fields.
    pub def: TableDef,
    pub transform: RowTransform,
}

fn unsupported(message: impl Into<String>) -> MigrateError {
    MigrateError::UnsupportedDelta(message.into())
}

/// Convert a literal to `ty`, failing as an unsupported delta.
fn coerce(value: &Value, ty: ColumnType, what: &str) -> Result<Value> {
    if value.fits(ty) {
        return Ok(value.clone());
    }
    value
        .convert(ty)
        .map_err(|e| unsupported(format!("{}: {}", what, e)))
}

struct Working {
    columns: Vec<(ColumnDef, ColumnSource)>,
    primary_key: Vec<String>,
    constraints: Vec<ConstraintDef>,
}

impl Working {
    fn position(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|(c, _)| c.name == name)
            .ok_or_else(|| unsupported(format!("column {} does not exist", name)))
    }

    fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|c| c == name)
    }

    fn ensure_new_column(&self, name: &str) -> Result<()> {
        if !is_valid_identifier(name) {
            return Err(unsupported(format!("invalid column name {}", name)));
        }
        if self.columns.iter().any(|(c, _)| c.name == name) {
            return Err(unsupported(format!("column {} already exists", name)));
        }
        Ok(())
    }

    fn apply(&mut self, op: &DeltaOp) -> Result<()> {
        match op {
            DeltaOp::AddColumn { column } => {
                self.ensure_new_column(&column.name)?;
                let mut column = column.clone();
                if let Some(default) = &column.default {
                    column.default = Some(coerce(
                        default,
                        column.ty,
                        &format!("default of column {}", column.name),
                    )?);
                }
                if !column.nullable && column.default.is_none() {
                    return Err(unsupported(format!(
                        "column {} is NOT NULL without a DEFAULT",
                        column.name
                    )));
                }
                let fill = column.default.clone().unwrap_or(Value::Null);
                self.columns.push((column, ColumnSource::Constant(fill)));
            }
            DeltaOp::DropColumn { name } => {
                let position = self.position(name)?;
                if self.is_primary_key(name) {
                    return Err(unsupported(format!(
                        "cannot drop primary key column {}",
                        name
                    )));
                }
                self.columns.remove(position);
                self.constraints
                    .retain(|c| !c.columns().contains(&name.as_str()));
            }
            DeltaOp::AlterColumnType { name, ty } => {
                let position = self.position(name)?;
                if self.is_primary_key(name) {
                    return Err(unsupported(format!(
                        "cannot change the type of primary key column {}",
                        name
                    )));
                }
                let (column, source) = &mut self.columns[position];
                if column.ty.conversion_to(*ty).is_none() {
                    return Err(unsupported(format!(
                        "no conversion from {} to {} for column {}",
                        column.ty, ty, name
                    )));
                }
                if let Some(default) = &column.default {
                    column.default = Some(coerce(default, *ty, &format!("default of column {}", name))?);
                }
                let next = match &*source {
                    ColumnSource::Source { index, .. } => ColumnSource::Source {
                        index: *index,
                        convert_to: Some(*ty),
                    },
                    ColumnSource::Constant(value) => ColumnSource::Constant(coerce(
                        value,
                        *ty,
                        &format!("fill value of column {}", name),
                    )?),
                };
                *source = next;
                column.ty = *ty;
                for constraint in &mut self.constraints {
                    if let ConstraintDef::Check { column, value, name: check, .. } = constraint {
                        if *column == *name {
                            *value = coerce(value, *ty, &format!("check constraint {}", check))?;
                        }
                    }
                }
            }
            DeltaOp::SetNotNull { name } => {
                let position = self.position(name)?;
                self.columns[position].0.nullable = false;
            }
            DeltaOp::DropNotNull { name } => {
                let position = self.position(name)?;
                if self.is_primary_key(name) {
                    return Err(unsupported(format!(
                        "primary key column {} must stay NOT NULL",
                        name
                    )));
                }
                self.columns[position].0.nullable = true;
            }
            DeltaOp::SetDefault { name, value } => {
                let position = self.position(name)?;
                let column = &mut self.columns[position].0;
                column.default = if value.is_null() {
                    None
                } else {
                    Some(coerce(value, column.ty, &format!("default of column {}", name))?)
                };
            }
            DeltaOp::DropDefault { name } => {
                let position = self.position(name)?;
                self.columns[position].0.default = None;
            }
            DeltaOp::RenameColumn { from, to } => {
                let position = self.position(from)?;
                if from != to {
                    self.ensure_new_column(to)?;
                }
                self.columns[position].0.name = to.clone();
                for pk in &mut self.primary_key {
                    if pk == from {
                        *pk = to.clone();
                    }
                }
                self.constraints = self
                    .constraints
                    .iter()
                    .map(|c| c.rename_column(from, to))
                    .collect();
            }
            DeltaOp::AddConstraint { constraint } => {
                let name = constraint.name();
                if !is_valid_identifier(name) {
                    return Err(unsupported(format!("invalid constraint name {}", name)));
                }
                if self.constraints.iter().any(|c| c.name() == name) {
                    return Err(unsupported(format!("constraint {} already exists", name)));
                }
                let constraint = match constraint {
                    ConstraintDef::Unique { name, columns } => {
                        if columns.is_empty() {
                            return Err(unsupported(format!("unique constraint {} has no columns", name)));
                        }
                        for (i, column) in columns.iter().enumerate() {
                            self.position(column)?;
                            if columns[..i].contains(column) {
                                return Err(unsupported(format!(
                                    "column {} listed twice in constraint {}",
                                    column, name
                                )));
                            }
                        }
                        constraint.clone()
                    }
                    ConstraintDef::Check {
                        name,
                        column,
                        op,
                        value,
                    } => {
                        let position = self.position(column)?;
                        let ty = self.columns[position].0.ty;
                        if value.is_null() {
                            return Err(unsupported(format!("check constraint {} compares with NULL", name)));
                        }
                        ConstraintDef::Check {
                            name: name.clone(),
                            column: column.clone(),
                            op: *op,
                            value: coerce(value, ty, &format!("check constraint {}", name))?,
                        }
                    }
                };
                self.constraints.push(constraint);
            }
            DeltaOp::DropConstraint { name } => {
                let before = self.constraints.len();
                self.constraints.retain(|c| c.name() != name);
                if self.constraints.len() == before {
                    return Err(unsupported(format!("constraint {} does not exist", name)));
                }
            }
        }
        Ok(())
    }
}

/// Apply `delta` to `live`, in order.
pub fn apply_delta(live: &TableDef, delta: &SchemaDelta) -> Result<AppliedDelta> {
    if delta.is_empty() {
        return Err(unsupported("empty schema change"));
    }

    let mut working = Working {
        columns: live
            .columns
            .iter()
            .enumerate()
            .map(|(index, c)| {
                (
                    c.clone(),
                    ColumnSource::Source {
                        index,
                        convert_to: None,
                    },
                )
            })
            .collect(),
        primary_key: live.primary_key.clone(),
        constraints: live.constraints.clone(),
    };
    for op in &delta.ops {
        working.apply(op)?;
    }

    let (columns, sources): (Vec<_>, Vec<_>) = working.columns.into_iter().unzip();
    let mut def = live.clone();
    def.columns = columns;
    def.primary_key = working.primary_key;
    def.constraints = working.constraints;
    def.validate().map_err(|e| unsupported(e.to_string()))?;

    Ok(AppliedDelta {
        def,
        transform: RowTransform { sources },
    })
}

/// Whether two definitions describe the same schema, ignoring name, storage
/// and bookkeeping fields.
pub fn same_schema(a: &TableDef, b: &TableDef) -> bool {
    a.columns == b.columns && a.primary_key == b.primary_key && a.constraints == b.constraints
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CheckOp;
    use pretty_assertions::assert_eq;

    fn accounts() -> TableDef {
        TableDef::new(
            "accounts",
            vec![
                ColumnDef::new("id", ColumnType::Int).not_null(),
                ColumnDef::new("email", ColumnType::Text),
                ColumnDef::new("age", ColumnType::Text),
            ],
            vec!["id"],
        )
        .with_constraint(ConstraintDef::Unique {
            name: "accounts_email_key".into(),
            columns: vec!["email".into()],
        })
    }

    fn delta(text: &str) -> SchemaDelta {
        SchemaDelta::parse(text).unwrap().1
    }

    #[test]
    fn test_add_not_null_column_with_default() {
        let applied = apply_delta(&accounts(), &delta("ADD COLUMN score int NOT NULL DEFAULT 0")).unwrap();
        assert_eq!(applied.def.columns.len(), 4);
        assert_eq!(
            applied.transform.sources[3],
            ColumnSource::Constant(Value::Int(0))
        );

        let row = Row::new(vec![Value::Int(7), Value::Text("a@x".into()), Value::Null]);
        let out = applied.transform.apply(&row).unwrap();
        assert_eq!(
            out.values,
            vec![Value::Int(7), Value::Text("a@x".into()), Value::Null, Value::Int(0)]
        );
        assert!(applied.def.validate_row(&out).is_ok());
    }

    #[test]
    fn test_rejections() {
        let live = accounts();
        let reject = |text: &str| {
            matches!(
                apply_delta(&live, &delta(text)),
                Err(MigrateError::UnsupportedDelta(_))
            )
        };
        assert!(reject("ADD COLUMN score int NOT NULL"));
        assert!(reject("DROP COLUMN id"));
        assert!(reject("ALTER COLUMN id TYPE text"));
        assert!(reject("ALTER COLUMN id DROP NOT NULL"));
        assert!(reject("DROP COLUMN missing"));
        assert!(reject("ADD COLUMN email text"));
        assert!(reject("RENAME COLUMN email TO age"));
        assert!(reject("ALTER COLUMN email TYPE bool"));
        assert!(reject("ADD COLUMN flag bool DEFAULT 'maybe'"));
        assert!(reject("DROP CONSTRAINT nope"));
        assert!(reject("ADD CONSTRAINT accounts_email_key UNIQUE (age)"));
        assert!(matches!(
            apply_delta(&live, &SchemaDelta::default()),
            Err(MigrateError::UnsupportedDelta(_))
        ));
    }

    #[test]
    fn test_type_change_converts_rows() {
        let applied = apply_delta(&accounts(), &delta("ALTER COLUMN age TYPE int")).unwrap();
        assert!(!applied.transform.is_identity());

        let ok = Row::new(vec![Value::Int(1), Value::Null, Value::Text(" 42 ".into())]);
        assert_eq!(
            applied.transform.apply(&ok).unwrap().values[2],
            Value::Int(42)
        );

        let bad = Row::new(vec![Value::Int(1), Value::Null, Value::Text("old".into())]);
        assert!(matches!(
            applied.transform.apply(&bad),
            Err(MigrateError::ConversionFailed(_))
        ));
    }

    #[test]
    fn test_drop_and_rename() {
        let applied = apply_delta(
            &accounts(),
            &delta("RENAME COLUMN email TO contact, DROP COLUMN age"),
        )
        .unwrap();
        let names: Vec<_> = applied.def.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "contact"]);
        assert_eq!(
            applied.def.constraints[0].columns(),
            vec!["contact"]
        );

        let row = Row::new(vec![Value::Int(1), Value::Text("a".into()), Value::Text("9".into())]);
        assert_eq!(
            applied.transform.apply(&row).unwrap().values,
            vec![Value::Int(1), Value::Text("a".into())]
        );
    }

    #[test]
    fn test_dropping_a_column_drops_its_constraints() {
        let applied = apply_delta(&accounts(), &delta("DROP COLUMN email")).unwrap();
        assert!(applied.def.constraints.is_empty());
    }

    #[test]
    fn test_check_literal_coerced_to_column_type() {
        let live = TableDef::new(
            "readings",
            vec![
                ColumnDef::new("id", ColumnType::Int).not_null(),
                ColumnDef::new("value", ColumnType::Float),
            ],
            vec!["id"],
        );
        let applied = apply_delta(&live, &delta("ADD CONSTRAINT positive CHECK (value > 0)")).unwrap();
        assert_eq!(
            applied.def.constraints[0],
            ConstraintDef::Check {
                name: "positive".into(),
                column: "value".into(),
                op: CheckOp::Gt,
                value: Value::Float(0.0),
            }
        );
        assert!(applied.transform.is_identity());
    }

    #[test]
    fn test_same_schema() {
        let live = accounts();
        let applied = apply_delta(&live, &delta("ALTER COLUMN email SET DEFAULT 'none'")).unwrap();
        assert!(!same_schema(&live, &applied.def));
        let mut renamed = live.clone();
        renamed.name = "other".into();
        renamed.version = 9;
        assert!(same_schema(&live, &renamed));
    }
}
