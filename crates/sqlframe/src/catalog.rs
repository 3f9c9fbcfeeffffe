//! Cached per-column summary statistics.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sqlframe_api::Value;

use crate::error::FrameError;

/// Plain aggregates the catalog can cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Count,
    Min,
    Max,
    Avg,
    Sum,
    Stddev,
    Variance,
}

impl Statistic {
    pub fn sql_function(&self) -> &'static str {
        match self {
            Statistic::Count => "COUNT",
            Statistic::Min => "MIN",
            Statistic::Max => "MAX",
            Statistic::Avg => "AVG",
            Statistic::Sum => "SUM",
            Statistic::Stddev => "STDDEV",
            Statistic::Variance => "VARIANCE",
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_function().to_lowercase())
    }
}

impl FromStr for Statistic {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "count" => Ok(Statistic::Count),
            "min" => Ok(Statistic::Min),
            "max" => Ok(Statistic::Max),
            "avg" | "mean" => Ok(Statistic::Avg),
            "sum" => Ok(Statistic::Sum),
            "stddev" | "std" => Ok(Statistic::Stddev),
            "variance" | "var" => Ok(Statistic::Variance),
            other => Err(FrameError::InvalidParameter(format!(
                "'{other}' is not a catalog statistic"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    entries: IndexMap<String, IndexMap<Statistic, Value>>,
}

impl Catalog {
    pub fn get(&self, column: &str, stat: Statistic) -> Option<&Value> {
        self.entries.get(column).and_then(|stats| stats.get(&stat))
    }

    pub fn insert(&mut self, column: &str, stat: Statistic, value: Value) {
        self.entries
            .entry(column.to_string())
            .or_default()
            .insert(stat, value);
    }

    /// Forget everything known about `column`.
    pub fn erase(&mut self, column: &str) {
        self.entries.shift_remove(column);
    }

    /// Give `to` the statistics currently cached for `from`.
    pub fn inherit(&mut self, from: &str, to: &str) {
        match self.entries.get(from).cloned() {
            Some(stats) => {
                self.entries.insert(to.to_string(), stats);
            }
            None => self.erase(to),
        }
    }

    pub fn is_cached(&self, column: &str) -> bool {
        self.entries.get(column).is_some_and(|s| !s.is_empty())
    }
}
