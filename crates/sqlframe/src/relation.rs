//! The relation: an ordered set of ledgered columns over one SQL source.
//!
//! Nothing is computed locally. Every operation either extends a column's
//! transform chain after a zero-row type probe, or sends an aggregate query
//! to the engine. The SQL of the current state is rebuilt on demand by
//! replaying all chains level by level (see [`Relation::current_relation`]).

use std::fmt;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use sqlframe_api::{classify, Category, FetchMode, QueryResult, Value};
use tracing::{debug, info, instrument};

use crate::catalog::{Catalog, Statistic};
use crate::column::ColumnMut;
use crate::config::FrameConfig;
use crate::error::{FrameError, Result};
use crate::executor::QueryExecutor;
use crate::expr::{Expr, Template};
use crate::history::HistoryEntry;
use crate::ident::{quote_ident, unquote_ident};
use crate::ledger::{Column, TransformStep};

/// Where the relation's rows come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationSource {
    /// A table or view name, used verbatim.
    Table(String),
    /// An arbitrary `SELECT` statement.
    Query(String),
}

/// Everything an operation may mutate. Cloned to roll back a failed
/// multi-step operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RelationState {
    pub columns: IndexMap<String, Column>,
    pub exclude: IndexSet<String>,
    pub catalog: Catalog,
    pub history: Vec<HistoryEntry>,
    pub scratch_seq: u64,
}

pub struct Relation {
    executor: Arc<dyn QueryExecutor>,
    config: FrameConfig,
    source: RelationSource,
    pub(crate) state: RelationState,
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("source", &self.source)
            .field("columns", &self.state.columns.keys().collect::<Vec<_>>())
            .field("exclude", &self.state.exclude)
            .finish()
    }
}

impl Relation {
    pub async fn from_table(executor: Arc<dyn QueryExecutor>, name: &str) -> Result<Self> {
        Self::new(executor, RelationSource::Table(name.to_string()), FrameConfig::default()).await
    }

    pub async fn from_query(executor: Arc<dyn QueryExecutor>, sql: &str) -> Result<Self> {
        Self::new(executor, RelationSource::Query(sql.to_string()), FrameConfig::default()).await
    }

    /// Describe `source` with a zero-row query and create one column per
    /// result column.
    #[instrument(skip(executor, config))]
    pub async fn new(
        executor: Arc<dyn QueryExecutor>,
        source: RelationSource,
        config: FrameConfig,
    ) -> Result<Self> {
        let mut relation = Self {
            executor,
            config,
            source,
            state: RelationState::default(),
        };
        let sql = format!("SELECT * FROM {} LIMIT 0", relation.source_sql());
        let described = relation
            .run(&sql, "describing the relation source", FetchMode::Describe)
            .await
            .map_err(|e| FrameError::query(relation.source_sql(), &e))?;

        for desc in described.columns {
            let alias = unquote_ident(&desc.name);
            if relation.find_column(&alias).is_some() {
                return Err(FrameError::DuplicateColumn(alias));
            }
            let column = Column::from_source(alias.clone(), desc.type_name.clone(), classify(&desc.type_name));
            relation.state.columns.insert(alias, column);
        }
        info!(
            columns = relation.state.columns.len(),
            "Relation created over {:?}", relation.source
        );
        Ok(relation)
    }

    pub fn config(&self) -> &FrameConfig {
        &self.config
    }

    pub fn source(&self) -> &RelationSource {
        &self.source
    }

    pub(crate) fn executor(&self) -> Arc<dyn QueryExecutor> {
        Arc::clone(&self.executor)
    }

    fn source_sql(&self) -> String {
        match &self.source {
            RelationSource::Table(name) => name.clone(),
            RelationSource::Query(sql) => format!("({sql}) {}", self.config.subtable_alias),
        }
    }

    /// Send one statement to the engine.
    pub(crate) async fn run(
        &self,
        sql: &str,
        purpose: &str,
        fetch: FetchMode,
    ) -> std::result::Result<QueryResult, sqlframe_api::EngineError> {
        debug!(purpose, %sql, "executing");
        self.executor.execute(sql, purpose, fetch).await
    }

    // -- columns ------------------------------------------------------------

    fn find_column(&self, name: &str) -> Option<&str> {
        let name = unquote_ident(name);
        if let Some((alias, _)) = self.state.columns.get_key_value(name.as_str()) {
            return Some(alias.as_str());
        }
        self.state
            .columns
            .keys()
            .find(|alias| alias.eq_ignore_ascii_case(&name))
            .map(String::as_str)
    }

    /// The real alias a user-supplied name refers to.
    ///
    /// Surrounding double quotes are ignored; an exact match wins over a
    /// case-insensitive one.
    pub fn resolve_column(&self, name: &str) -> Result<String> {
        self.find_column(name)
            .map(str::to_string)
            .ok_or_else(|| FrameError::MissingColumn(unquote_ident(name)))
    }

    pub fn get_column(&self, name: &str) -> Result<&Column> {
        let alias = self.resolve_column(name)?;
        self.state
            .columns
            .get(&alias)
            .ok_or(FrameError::MissingColumn(alias))
    }

    /// A mutating handle on one column.
    pub fn column(&mut self, name: &str) -> Result<ColumnMut<'_>> {
        let alias = self.resolve_column(name)?;
        Ok(ColumnMut::new(self, alias))
    }

    pub(crate) fn ensure_new_name(&self, name: &str) -> Result<String> {
        let name = unquote_ident(name);
        match self.find_column(&name) {
            Some(existing) => Err(FrameError::DuplicateColumn(existing.to_string())),
            None => Ok(name),
        }
    }

    /// Visible column aliases, in display order.
    pub fn columns(&self) -> Vec<String> {
        self.state
            .columns
            .keys()
            .filter(|alias| !self.state.exclude.contains(*alias))
            .cloned()
            .collect()
    }

    pub fn all_columns(&self) -> Vec<String> {
        self.state.columns.keys().cloned().collect()
    }

    pub fn exclude_columns(&self) -> Vec<String> {
        self.state.exclude.iter().cloned().collect()
    }

    pub fn numeric_columns(&self) -> Vec<String> {
        self.columns()
            .into_iter()
            .filter(|alias| {
                self.state
                    .columns
                    .get(alias)
                    .is_some_and(|c| c.category().is_numeric())
            })
            .collect()
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.state.history
    }

    pub(crate) fn add_to_history(&mut self, message: String) {
        self.state.history.push(HistoryEntry::now(message));
    }

    /// Deterministic, collision-free name for a scratch column. Names in
    /// `reserved` are about to be created by the same call and are skipped.
    pub(crate) fn next_scratch_name(
        &mut self,
        column: &str,
        stat: &str,
        reserved: &[String],
    ) -> String {
        loop {
            self.state.scratch_seq += 1;
            let candidate = crate::ident::generated_name([
                column,
                stat,
                &self.state.scratch_seq.to_string(),
            ]);
            let taken = reserved.iter().any(|r| r.eq_ignore_ascii_case(&candidate));
            if !taken && self.find_column(&candidate).is_none() {
                return candidate;
            }
        }
    }

    pub(crate) fn exclude(&mut self, alias: &str) {
        if self.state.columns.contains_key(alias) {
            self.state.exclude.insert(alias.to_string());
        }
    }

    /// Remove columns together with their catalog entries and exclusion.
    pub fn drop_columns(&mut self, names: &[&str]) -> Result<&mut Self> {
        let aliases = names
            .iter()
            .map(|name| self.resolve_column(name))
            .collect::<Result<Vec<_>>>()?;
        for alias in aliases {
            self.state.columns.shift_remove(&alias);
            self.state.exclude.shift_remove(&alias);
            self.state.catalog.erase(&alias);
            self.add_to_history(format!("[Drop]: The column '{alias}' was deleted."));
        }
        Ok(self)
    }

    // -- SQL generation -----------------------------------------------------

    /// The SQL of the relation in its current state.
    ///
    /// Level 0 selects every column's first step from the source. Each
    /// following level wraps the previous one and applies the steps found at
    /// that depth; shorter chains pass through and columns that do not exist
    /// yet are left out.
    pub fn current_relation(&self) -> String {
        let depth = self
            .state
            .columns
            .values()
            .map(Column::depth)
            .max()
            .unwrap_or(1);
        let sub = &self.config.subtable_alias;

        let mut select = String::new();
        let mut from = self.source_sql();
        for level in 0..depth {
            let projections: Vec<String> = self
                .state
                .columns
                .values()
                .filter_map(|column| project(column, level))
                .collect();
            let projections = if projections.is_empty() {
                "*".to_string()
            } else {
                projections.join(", ")
            };
            select = format!("SELECT {projections} FROM {from}");
            from = format!("({select}) {sub}");
        }
        select
    }

    /// Projection of the visible columns over the current relation.
    pub fn select_sql(&self) -> String {
        let visible: Vec<String> = self.columns().iter().map(|c| quote_ident(c)).collect();
        let projections = if visible.is_empty() {
            "*".to_string()
        } else {
            visible.join(", ")
        };
        format!(
            "SELECT {projections} FROM ({}) {}",
            self.current_relation(),
            self.config.subtable_alias
        )
    }

    fn probe_sql(&self, expression: &str, not_null: Option<&str>) -> String {
        let filter = not_null
            .map(|alias| format!(" WHERE {} IS NOT NULL", quote_ident(alias)))
            .unwrap_or_default();
        format!(
            "SELECT {expression} AS {} FROM ({}) {}{filter} LIMIT 0",
            self.config.probe_alias,
            self.current_relation(),
            self.config.subtable_alias
        )
    }

    /// Ask the engine which type `expression` has, without reading rows.
    pub(crate) async fn probe_type(
        &self,
        expression: &str,
        not_null: Option<&str>,
    ) -> Result<(String, Category)> {
        let sql = self.probe_sql(expression, not_null);
        let result = self
            .run(&sql, "computing the type of a new expression", FetchMode::Describe)
            .await
            .map_err(|e| FrameError::query(expression, &e))?;
        let data_type = result
            .first_type()
            .ok_or_else(|| FrameError::Query {
                expression: expression.to_string(),
                message: "the type probe returned no column".to_string(),
            })?
            .to_string();
        let category = classify(&data_type);
        Ok((data_type, category))
    }

    /// Deepest chain among the columns `template` refers to.
    pub(crate) fn floor_for(&self, template: &Template) -> usize {
        self.state
            .columns
            .values()
            .filter(|column| template.references(column.alias()))
            .map(Column::depth)
            .max()
            .unwrap_or(0)
    }

    // -- ledger mutation ----------------------------------------------------

    /// Extend the chain of `alias` (or of a copy of it) with `template`.
    ///
    /// The type probe runs before anything is written: when it fails the
    /// relation is unchanged.
    #[instrument(skip(self, template), fields(template = %template))]
    pub(crate) async fn apply_transform(
        &mut self,
        alias: &str,
        template: &Template,
        copy_alias: Option<&str>,
    ) -> Result<()> {
        let copy_alias = copy_alias.map(|name| self.ensure_new_name(name)).transpose()?;
        let applied = template.render_for(alias);
        let (data_type, category) = self.probe_type(&applied, Some(alias)).await?;
        let floor = self.floor_for(template);
        let step = TransformStep::new(template.clone(), data_type, category);

        let source = self
            .state
            .columns
            .get_mut(alias)
            .ok_or_else(|| FrameError::MissingColumn(alias.to_string()))?;
        match copy_alias {
            Some(name) => {
                let mut copy = source.renamed(name.clone());
                copy.pad_to(floor);
                copy.push(step);
                let depth = copy.depth();
                self.state.columns.insert(name.clone(), copy);
                self.state.catalog.inherit(alias, &name);
                self.add_to_history(format!(
                    "[Add Copy]: A copy of the column '{alias}' named '{name}' was added."
                ));
                info!(column = %name, depth, "Copy committed");
            }
            None => {
                source.pad_to(floor);
                source.push(step);
                let depth = source.depth();
                self.state.catalog.erase(alias);
                info!(column = %alias, depth, "Transform committed");
            }
        }
        self.add_to_history(format!(
            "[Apply]: The column '{alias}' was transformed with the func 'x -> {applied}'."
        ));
        Ok(())
    }

    /// Add a column computed from `expr`.
    pub async fn eval(&mut self, name: &str, expr: impl Into<Template>) -> Result<&mut Self> {
        let name = self.eval_column(name, &expr.into()).await?;
        self.add_to_history(format!("[Eval]: A new column '{name}' was added."));
        Ok(self)
    }

    /// Shared by [`Relation::eval`] and scratch column creation, which does
    /// not log history.
    #[instrument(skip(self, template), fields(template = %template))]
    pub(crate) async fn eval_column(&mut self, name: &str, template: &Template) -> Result<String> {
        let name = self.ensure_new_name(name)?;
        if template.has_placeholder() {
            return Err(FrameError::InvalidParameter(format!(
                "the expression of '{name}' cannot contain a '{{}}' placeholder"
            )));
        }
        let sql = template.to_string();
        let (data_type, category) = self.probe_type(&sql, None).await?;
        let floor = self.floor_for(template);
        let column = Column::derived(name.clone(), floor, template.clone(), data_type, category);
        info!(column = %name, depth = column.depth(), "Column created");
        self.state.columns.insert(name.clone(), column);
        Ok(name)
    }

    // -- catalog ------------------------------------------------------------

    /// A plain aggregate of one column, served from the catalog when cached.
    #[instrument(skip(self))]
    pub async fn statistic(&mut self, column: &str, stat: Statistic) -> Result<Value> {
        let alias = self.resolve_column(column)?;
        if let Some(value) = self.state.catalog.get(&alias, stat) {
            debug!("catalog hit");
            return Ok(value.clone());
        }
        let expression = format!("{}({})", stat.sql_function(), quote_ident(&alias));
        let sql = format!(
            "SELECT {expression} FROM ({}) {}",
            self.current_relation(),
            self.config.subtable_alias
        );
        let result = self
            .run(&sql, "computing a column aggregate", FetchMode::One)
            .await
            .map_err(|e| FrameError::query(&expression, &e))?;
        let value = result.scalar().cloned().unwrap_or(Value::Null);
        self.state.catalog.insert(&alias, stat, value.clone());
        Ok(value)
    }

    /// Number of non-null values of `column`.
    pub async fn count(&mut self, column: &str) -> Result<i64> {
        let value = self.statistic(column, Statistic::Count).await?;
        value.as_i64().ok_or_else(|| FrameError::Query {
            expression: format!("COUNT({column})"),
            message: format!("expected an integer, got {value:?}"),
        })
    }

    pub async fn row_count(&self) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM ({}) {}",
            self.current_relation(),
            self.config.subtable_alias
        );
        let result = self
            .run(&sql, "counting the rows of the relation", FetchMode::One)
            .await
            .map_err(|e| FrameError::query("COUNT(*)", &e))?;
        result
            .scalar()
            .and_then(Value::as_i64)
            .ok_or_else(|| FrameError::Query {
                expression: "COUNT(*)".to_string(),
                message: "the engine returned no row count".to_string(),
            })
    }
}

/// The projection of `column` at replay `level`, or `None` when the column
/// does not exist yet at that level.
fn project(column: &Column, level: usize) -> Option<String> {
    let alias = quote_ident(column.alias());
    let Some(step) = column.step(level) else {
        return Some(alias);
    };
    let template = step.template.as_ref()?;
    let input = if level == 0 {
        column.origin().clone()
    } else {
        Expr::column(column.alias())
    };
    let rendered = template.apply_to(&input).to_string();
    if rendered == alias {
        Some(alias)
    } else {
        Some(format!("{rendered} AS {alias}"))
    }
}
