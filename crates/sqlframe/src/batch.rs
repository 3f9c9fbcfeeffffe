//! Relation-wide transformations, applied column by column.

use sqlframe_api::Category;
use tracing::{instrument, warn};

use crate::error::Result;
use crate::expr::{Literal, Template};
use crate::functions::ScalarFunc;
use crate::relation::Relation;

impl Relation {
    /// Apply one template per column.
    ///
    /// Keys are resolved before anything runs. When one of the transforms
    /// fails, the transforms already applied by this call are undone.
    #[instrument(skip(self, mapping))]
    pub async fn apply<I, K, T>(&mut self, mapping: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, T)>,
        K: AsRef<str>,
        T: Into<Template>,
    {
        let mut resolved = Vec::new();
        for (name, template) in mapping {
            resolved.push((self.resolve_column(name.as_ref())?, template.into()));
        }

        let snapshot = self.state.clone();
        for (alias, template) in &resolved {
            if let Err(e) = self.apply_transform(alias, template, None).await {
                self.state = snapshot;
                warn!(column = %alias, error = %e, "batch apply rolled back");
                return Err(e);
            }
        }
        Ok(self)
    }

    /// Apply `template` to every numeric column, or to every visible column
    /// when `numeric_only` is false.
    ///
    /// Boolean columns get their placeholder cast to `int` first.
    pub async fn applymap(
        &mut self,
        template: impl Into<Template>,
        numeric_only: bool,
    ) -> Result<&mut Self> {
        let template = template.into();
        let columns = if numeric_only {
            self.numeric_columns()
        } else {
            self.columns()
        };
        let mut mapping = Vec::with_capacity(columns.len());
        for alias in columns {
            let column_template = if self.get_column(&alias)?.category() == Category::Boolean {
                template.cast_placeholder("int")
            } else {
                template.clone()
            };
            mapping.push((alias, column_template));
        }
        self.apply(mapping).await
    }

    /// Absolute value of `columns`, or of every numeric column when empty.
    pub async fn abs(&mut self, columns: &[&str]) -> Result<&mut Self> {
        let targets = if columns.is_empty() {
            self.numeric_columns()
        } else {
            columns
                .iter()
                .map(|c| self.resolve_column(c))
                .collect::<Result<Vec<_>>>()?
        };
        self.apply_to_each(targets, ScalarFunc::Abs, None).await
    }

    /// Round up every float column.
    pub async fn ceil(&mut self) -> Result<&mut Self> {
        let targets = self.float_columns();
        self.apply_to_each(targets, ScalarFunc::Ceil, None).await
    }

    /// Round down every float column.
    pub async fn floor(&mut self) -> Result<&mut Self> {
        let targets = self.float_columns();
        self.apply_to_each(targets, ScalarFunc::Floor, None).await
    }

    /// Round every float column to `n` decimals.
    pub async fn round(&mut self, n: i64) -> Result<&mut Self> {
        let targets = self.float_columns();
        self.apply_to_each(targets, ScalarFunc::Round, Some(Literal::Int(n)))
            .await
    }

    fn float_columns(&self) -> Vec<String> {
        self.numeric_columns()
            .into_iter()
            .filter(|alias| {
                self.get_column(alias)
                    .is_ok_and(|c| c.category() == Category::Float)
            })
            .collect()
    }

    async fn apply_to_each(
        &mut self,
        columns: Vec<String>,
        func: ScalarFunc,
        x: Option<Literal>,
    ) -> Result<&mut Self> {
        let x = x.unwrap_or(Literal::Int(2));
        let mut mapping = Vec::with_capacity(columns.len());
        for alias in columns {
            let category = self.get_column(&alias)?.category();
            mapping.push((alias, func.compile(category, &x)));
        }
        self.apply(mapping).await
    }
}
