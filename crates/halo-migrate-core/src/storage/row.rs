//! Stored rows.

use crate::catalog::Value;
use crate::error::rkyv_codec;
use rkyv::{Archive, Deserialize, Serialize};

/// A row: one value per column, in column order.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Row {
    pub values: Vec<Value>,
}

rkyv_codec!(Row);

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

impl From<Vec<Value>> for Row {
    fn from(values: Vec<Value>) -> Self {
        Self { values }
    }
}
