//! Column types, values and the conversions allowed by type changes.

use crate::error::{Error, Result};
use rkyv::{Archive, Deserialize, Serialize};
use std::cmp::Ordering;

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum ColumnType {
    Bool,
    /// 64-bit signed integer.
    Int,
    /// 64-bit float.
    Float,
    /// UTF-8 text.
    Text,
    Bytes,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::Bool => write!(f, "bool"),
            ColumnType::Int => write!(f, "int"),
            ColumnType::Float => write!(f, "float"),
            ColumnType::Text => write!(f, "text"),
            ColumnType::Bytes => write!(f, "bytes"),
        }
    }
}

impl From<halo_migrate_lang::DataType> for ColumnType {
    fn from(ty: halo_migrate_lang::DataType) -> Self {
        use halo_migrate_lang::DataType;
        match ty {
            DataType::Bool => ColumnType::Bool,
            DataType::Int => ColumnType::Int,
            DataType::Float => ColumnType::Float,
            DataType::Text => ColumnType::Text,
            DataType::Bytes => ColumnType::Bytes,
        }
    }
}

/// How a value of one column type becomes a value of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Same type, value kept as is.
    Identity,
    /// Always succeeds.
    Infallible,
    /// May fail for some values (parsing, truncation).
    Fallible,
}

impl ColumnType {
    /// The conversion from `self` to `to`, or `None` if unsupported.
    pub fn conversion_to(self, to: ColumnType) -> Option<Conversion> {
        use ColumnType::*;
        if self == to {
            return Some(Conversion::Identity);
        }
        match (self, to) {
            (Int, Float) | (Int, Text) | (Int, Bool) | (Float, Text) | (Bool, Text)
            | (Bool, Int) | (Text, Bytes) => Some(Conversion::Infallible),
            (Text, Int) | (Text, Float) | (Text, Bool) | (Float, Int) | (Bytes, Text) => {
                Some(Conversion::Fallible)
            }
            _ => None,
        }
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The column type of this value, `None` for null.
    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ColumnType::Bool),
            Value::Int(_) => Some(ColumnType::Int),
            Value::Float(_) => Some(ColumnType::Float),
            Value::Text(_) => Some(ColumnType::Text),
            Value::Bytes(_) => Some(ColumnType::Bytes),
        }
    }

    /// Whether the value can be stored in a column of type `ty`.
    pub fn fits(&self, ty: ColumnType) -> bool {
        self.column_type().map_or(true, |t| t == ty)
    }

    /// Convert to another column type. Null converts to null.
    pub fn convert(&self, to: ColumnType) -> Result<Value> {
        let from = match self.column_type() {
            None => return Ok(Value::Null),
            Some(from) if from == to => return Ok(self.clone()),
            Some(from) => from,
        };

        let failed = |reason: &str| Error::Conversion(format!("{} to {}: {}", self, to, reason));

        let converted = match (self, to) {
            (Value::Int(i), ColumnType::Float) => Value::Float(*i as f64),
            (Value::Int(i), ColumnType::Text) => Value::Text(i.to_string()),
            (Value::Int(i), ColumnType::Bool) => Value::Bool(*i != 0),
            (Value::Float(f), ColumnType::Text) => Value::Text(f.to_string()),
            (Value::Bool(b), ColumnType::Text) => Value::Text(b.to_string()),
            (Value::Bool(b), ColumnType::Int) => Value::Int(i64::from(*b)),
            (Value::Text(s), ColumnType::Bytes) => Value::Bytes(s.as_bytes().to_vec()),
            (Value::Text(s), ColumnType::Int) => Value::Int(
                s.trim()
                    .parse::<i64>()
                    .map_err(|_| failed("not an integer"))?,
            ),
            (Value::Text(s), ColumnType::Float) => Value::Float(
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| failed("not a number"))?,
            ),
            (Value::Text(s), ColumnType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Value::Bool(true),
                "false" | "f" | "no" | "0" => Value::Bool(false),
                _ => return Err(failed("not a boolean")),
            },
            (Value::Float(f), ColumnType::Int) => {
                if f.fract() != 0.0 || !f.is_finite() {
                    return Err(failed("not integral"));
                }
                if *f < i64::MIN as f64 || *f >= i64::MAX as f64 {
                    return Err(failed("out of range"));
                }
                Value::Int(*f as i64)
            }
            (Value::Bytes(b), ColumnType::Text) => Value::Text(
                String::from_utf8(b.clone()).map_err(|_| failed("invalid utf-8"))?,
            ),
            _ => {
                return Err(Error::Conversion(format!(
                    "unsupported conversion from {} to {}",
                    from, to
                )))
            }
        };
        Ok(converted)
    }

    /// Compare two values of compatible types. Ints and floats compare
    /// numerically; null and mismatched types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => write!(f, "'\\x{}'", hex::encode(b)),
        }
    }
}

impl From<&halo_migrate_lang::Literal> for Value {
    fn from(literal: &halo_migrate_lang::Literal) -> Self {
        use halo_migrate_lang::Literal;
        match literal {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::Text(s.clone()),
        }
    }
}

/// Comparison operator of a check constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum CheckOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CheckOp {
    /// Evaluate `lhs op rhs`. Null or incomparable operands pass, as in SQL
    /// where an unknown check result does not reject the row.
    pub fn holds(self, lhs: &Value, rhs: &Value) -> bool {
        let Some(ordering) = lhs.compare(rhs) else {
            return true;
        };
        match self {
            CheckOp::Eq => ordering == Ordering::Equal,
            CheckOp::Ne => ordering != Ordering::Equal,
            CheckOp::Lt => ordering == Ordering::Less,
            CheckOp::Le => ordering != Ordering::Greater,
            CheckOp::Gt => ordering == Ordering::Greater,
            CheckOp::Ge => ordering != Ordering::Less,
        }
    }
}

impl std::fmt::Display for CheckOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            CheckOp::Eq => "=",
            CheckOp::Ne => "<>",
            CheckOp::Lt => "<",
            CheckOp::Le => "<=",
            CheckOp::Gt => ">",
            CheckOp::Ge => ">=",
        };
        f.write_str(op)
    }
}

impl From<halo_migrate_lang::ComparisonOp> for CheckOp {
    fn from(op: halo_migrate_lang::ComparisonOp) -> Self {
        use halo_migrate_lang::ComparisonOp;
        match op {
            ComparisonOp::Eq => CheckOp::Eq,
            ComparisonOp::Ne => CheckOp::Ne,
            ComparisonOp::Lt => CheckOp::Lt,
            ComparisonOp::Le => CheckOp::Le,
            ComparisonOp::Gt => CheckOp::Gt,
            ComparisonOp::Ge => CheckOp::Ge,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_table() {
        assert_eq!(
            ColumnType::Int.conversion_to(ColumnType::Int),
            Some(Conversion::Identity)
        );
        assert_eq!(
            ColumnType::Int.conversion_to(ColumnType::Text),
            Some(Conversion::Infallible)
        );
        assert_eq!(
            ColumnType::Text.conversion_to(ColumnType::Int),
            Some(Conversion::Fallible)
        );
        assert_eq!(ColumnType::Bytes.conversion_to(ColumnType::Int), None);
        assert_eq!(ColumnType::Float.conversion_to(ColumnType::Bool), None);
    }

    #[test]
    fn test_convert_values() {
        assert_eq!(Value::Int(7).convert(ColumnType::Float).unwrap(), Value::Float(7.0));
        assert_eq!(
            Value::Text(" 42 ".into()).convert(ColumnType::Int).unwrap(),
            Value::Int(42)
        );
        assert_eq!(
            Value::Text("T".into()).convert(ColumnType::Bool).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(Value::Float(3.0).convert(ColumnType::Int).unwrap(), Value::Int(3));
        assert_eq!(Value::Null.convert(ColumnType::Int).unwrap(), Value::Null);
    }

    #[test]
    fn test_fallible_conversions_fail() {
        assert!(Value::Text("abc".into()).convert(ColumnType::Int).is_err());
        assert!(Value::Float(2.5).convert(ColumnType::Int).is_err());
        assert!(Value::Bytes(vec![0xff, 0xfe]).convert(ColumnType::Text).is_err());
        assert!(Value::Bytes(vec![1]).convert(ColumnType::Int).is_err());
    }

    #[test]
    fn test_check_op_semantics() {
        assert!(CheckOp::Ge.holds(&Value::Int(0), &Value::Int(0)));
        assert!(!CheckOp::Gt.holds(&Value::Int(0), &Value::Int(0)));
        assert!(CheckOp::Lt.holds(&Value::Int(1), &Value::Float(1.5)));
        // unknown results pass
        assert!(CheckOp::Gt.holds(&Value::Null, &Value::Int(0)));
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Text("it's".into()).to_string(), "'it''s'");
        assert_eq!(Value::Bytes(vec![0xab]).to_string(), "'\\xab'");
        assert_eq!(Value::Null.to_string(), "NULL");
    }
}
