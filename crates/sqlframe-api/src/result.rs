//! Result sets returned by the query execution collaborator.

use serde::{Deserialize, Serialize};

use crate::Value;

/// How much of a result the caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchMode {
    /// Column metadata only; used with `LIMIT 0` type probes.
    Describe,
    /// The first row.
    One,
    /// Every row.
    All,
}

/// Name and engine type of one result column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescription {
    pub name: String,
    pub type_name: String,
}

impl ColumnDescription {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<ColumnDescription>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// A zero-row result carrying only metadata.
    pub fn describe(columns: Vec<ColumnDescription>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Engine type of the first column, if any.
    pub fn first_type(&self) -> Option<&str> {
        self.columns.first().map(|c| c.type_name.as_str())
    }

    /// First cell of the first row.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}
