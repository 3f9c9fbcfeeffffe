//! Pandas-style column operations compiled to SQL.
//!
//! A [`Relation`] wraps a table or query of a remote analytical engine. Its
//! columns are ledgers of SQL rewrites: mutating a column appends a step
//! after a zero-row type probe, and the SQL of the current state is rebuilt
//! on demand. All computation happens in the engine, reached through a
//! [`QueryExecutor`].

pub mod analytic;
pub mod batch;
pub mod catalog;
pub mod column;
pub mod config;
pub mod error;
pub mod executor;
pub mod expr;
pub mod functions;
pub mod history;
pub mod ident;
pub mod ledger;
pub mod relation;
pub mod testing;

pub use analytic::{
    Aggregate, AnalyticFunc, AnalyticPlan, AnalyticRequest, Moment, Pairwise, PlanStep, Ranking,
};
pub use catalog::Statistic;
pub use column::ColumnMut;
pub use config::FrameConfig;
pub use error::{FrameError, Result};
pub use executor::QueryExecutor;
pub use expr::{BinaryOp, Expr, Literal, OrderKey, SortOrder, Template, WindowSpec};
pub use functions::ScalarFunc;
pub use history::HistoryEntry;
pub use ledger::{Column, StepSummary, TransformStep};
pub use relation::{Relation, RelationSource};

pub use sqlframe_api::{
    classify, Category, ColumnDescription, EngineError, FetchMode, QueryResult, Value,
};
