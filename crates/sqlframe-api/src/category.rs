//! Coarse semantic categories of engine data types.
//!
//! Function dispatch (e.g. which SQL function computes a "length") only cares
//! about the category of a column, never about the precise engine type.

use serde::{Deserialize, Serialize};

/// Semantic category of an engine type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Int,
    Float,
    Text,
    Date,
    Boolean,
    Binary,
    Spatial,
    Uuid,
    /// Flexible key/value maps
    VMap,
    /// Arrays, sets and rows
    Complex,
    Undefined,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Int => "int",
            Category::Float => "float",
            Category::Text => "text",
            Category::Date => "date",
            Category::Boolean => "bool",
            Category::Binary => "binary",
            Category::Spatial => "spatial",
            Category::Uuid => "uuid",
            Category::VMap => "vmap",
            Category::Complex => "complex",
            Category::Undefined => "undefined",
        }
    }

    /// Numeric categories accept arithmetic without a cast.
    pub fn is_numeric(&self) -> bool {
        matches!(self, Category::Int | Category::Float)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Map an engine type name (e.g. `varchar(80)`, `numeric(10,2)`,
/// `Array[int]`) to its category.
///
/// Pure and total: unknown names classify as [`Category::Undefined`].
pub fn classify(engine_type: &str) -> Category {
    let ctype = engine_type.trim().to_ascii_lowercase();
    let starts = |prefixes: &[&str]| prefixes.iter().any(|p| ctype.starts_with(p));

    if ctype.is_empty() {
        Category::Undefined
    } else if starts(&["array", "row", "set"]) {
        Category::Complex
    } else if ctype == "vmap" || starts(&["long varbinary"]) {
        Category::VMap
    } else if starts(&["geometry", "geography"]) {
        Category::Spatial
    } else if starts(&["uuid"]) {
        Category::Uuid
    } else if starts(&["bool"]) {
        Category::Boolean
    } else if starts(&["date", "time", "interval", "smalldatetime"]) {
        // before "int" so that "interval" is temporal
        Category::Date
    } else if starts(&["int", "tinyint", "smallint", "bigint"]) {
        Category::Int
    } else if starts(&[
        "float", "double", "real", "numeric", "decimal", "number", "money",
    ]) {
        Category::Float
    } else if starts(&["binary", "varbinary", "bytea", "raw"]) {
        Category::Binary
    } else if starts(&["char", "varchar", "long varchar", "text", "string"]) {
        Category::Text
    } else {
        Category::Undefined
    }
}
