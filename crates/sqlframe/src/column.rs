//! Mutating operations on one column of a [`Relation`].

use sqlframe_api::Category;

use crate::error::{FrameError, Result};
use crate::expr::{Expr, Literal, Template};
use crate::functions::ScalarFunc;
use crate::ident::quote_ident;
use crate::ledger::Column;
use crate::relation::{Relation, RelationSource};

const DATE_PARTS: &[&str] = &[
    "CENTURY",
    "DAY",
    "DECADE",
    "DOQ",
    "DOW",
    "DOY",
    "EPOCH",
    "HOUR",
    "ISODOW",
    "ISOWEEK",
    "ISOYEAR",
    "MICROSECONDS",
    "MILLENNIUM",
    "MILLISECONDS",
    "MINUTE",
    "MONTH",
    "QUARTER",
    "SECOND",
    "TIME ZONE",
    "TIMEZONE_HOUR",
    "TIMEZONE_MINUTE",
    "WEEK",
    "YEAR",
];

const SLICE_UNITS: &[&str] = &[
    "YEAR",
    "MONTH",
    "DAY",
    "HOUR",
    "MINUTE",
    "SECOND",
    "MILLISECOND",
    "MICROSECOND",
];

/// A handle on one column, holding the owning relation mutably.
///
/// Every operation consumes the handle and hands the relation back, so calls
/// chain:
///
/// ```rust,no_run
/// # async fn example(rel: &mut sqlframe::Relation) -> sqlframe::Result<()> {
/// rel.column("price")?.abs().await?.column("price")?.round(2).await?;
/// # Ok(())
/// # }
/// ```
pub struct ColumnMut<'a> {
    relation: &'a mut Relation,
    alias: String,
}

impl<'a> ColumnMut<'a> {
    pub(crate) fn new(relation: &'a mut Relation, alias: String) -> Self {
        Self { relation, alias }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn info(&self) -> Result<&Column> {
        self.relation.get_column(&self.alias)
    }

    fn category(&self) -> Result<Category> {
        Ok(self.info()?.category())
    }

    /// Replace the column by `template` applied to its current value, or
    /// store the result under `copy_alias` and leave this column as it is.
    pub async fn apply(
        self,
        template: impl Into<Template>,
        copy_alias: Option<&str>,
    ) -> Result<&'a mut Relation> {
        let template = template.into();
        self.relation
            .apply_transform(&self.alias, &template, copy_alias)
            .await?;
        Ok(self.relation)
    }

    /// Apply a named scalar function. `x` defaults to 2.
    pub async fn apply_fun(self, func: ScalarFunc, x: Option<Literal>) -> Result<&'a mut Relation> {
        let x = x.unwrap_or(Literal::Int(2));
        let template = func.compile(self.category()?, &x);
        self.apply(template, None).await
    }

    pub async fn abs(self) -> Result<&'a mut Relation> {
        self.apply_fun(ScalarFunc::Abs, None).await
    }

    /// Add `x`; temporal columns are shifted by `x` seconds.
    pub async fn add(self, x: f64) -> Result<&'a mut Relation> {
        let template = if self.category()? == Category::Date {
            Expr::func(
                "TIMESTAMPADD",
                vec![Expr::keyword("SECOND"), Expr::float(x), Expr::Current],
            )
        } else {
            Expr::Current.add(Expr::float(x))
        };
        self.apply(template, None).await
    }

    /// Subtract `x`; temporal columns are shifted back by `x` seconds.
    pub async fn sub(self, x: f64) -> Result<&'a mut Relation> {
        let template = if self.category()? == Category::Date {
            Expr::func(
                "TIMESTAMPADD",
                vec![Expr::keyword("SECOND"), Expr::float(x).neg(), Expr::Current],
            )
        } else {
            Expr::Current.sub(Expr::float(x))
        };
        self.apply(template, None).await
    }

    pub async fn mul(self, x: f64) -> Result<&'a mut Relation> {
        self.apply(Expr::Current.mul(Expr::float(x)), None).await
    }

    pub async fn div(self, x: f64) -> Result<&'a mut Relation> {
        if x == 0.0 {
            return Err(FrameError::InvalidParameter(
                "Division by 0 is forbidden".to_string(),
            ));
        }
        self.apply(Expr::Current.div(Expr::float(x)), None).await
    }

    pub async fn round(self, n: i64) -> Result<&'a mut Relation> {
        self.apply_fun(ScalarFunc::Round, Some(Literal::Int(n))).await
    }

    /// Extract a field (`DAY`, `HOUR`, ...) from a temporal column.
    pub async fn date_part(self, field: &str) -> Result<&'a mut Relation> {
        let field = field.trim().to_uppercase();
        if !DATE_PARTS.contains(&field.as_str()) {
            return Err(FrameError::InvalidParameter(format!(
                "'{field}' is not a date part; expected one of {}",
                DATE_PARTS.join(", ")
            )));
        }
        let template = Expr::func(
            "DATE_PART",
            vec![Expr::Literal(Literal::String(field)), Expr::Current],
        );
        self.apply(template, None).await
    }

    /// Round timestamps to slices of `length` `unit`s, to the start of the
    /// slice when `start` is set and to its end otherwise.
    pub async fn slice(self, length: i64, unit: &str, start: bool) -> Result<&'a mut Relation> {
        let unit = unit.trim().to_uppercase();
        if !SLICE_UNITS.contains(&unit.as_str()) {
            return Err(FrameError::InvalidParameter(format!(
                "'{unit}' is not a time slice unit"
            )));
        }
        if length <= 0 {
            return Err(FrameError::InvalidParameter(format!(
                "slice length must be positive, got {length}"
            )));
        }
        let template = Expr::func(
            "TIME_SLICE",
            vec![
                Expr::Current,
                Expr::int(length),
                Expr::string(unit),
                Expr::string(if start { "START" } else { "END" }),
            ],
        );
        self.apply(template, None).await
    }

    /// A new relation holding only the length of this column's values.
    ///
    /// This column's ledger is left untouched.
    pub async fn get_len(self) -> Result<Relation> {
        let column = self.info()?;
        let func = match column.category() {
            Category::VMap => "MAPSIZE",
            Category::Complex => "APPLY_COUNT_ELEMENTS",
            _ => "LENGTH",
        };
        let init_transform = Template::new(Expr::func(func, vec![column.init_transform().expr().clone()]));
        let new_alias = format!("{}.length", self.alias);
        let query = format!(
            "SELECT {func}({}) AS {} FROM ({}) {}",
            quote_ident(&self.alias),
            quote_ident(&new_alias),
            self.relation.current_relation(),
            self.relation.config().subtable_alias
        );
        tracing::debug!(column = %self.alias, "building length relation");

        let mut lengths = Relation::new(
            self.relation.executor(),
            RelationSource::Query(query),
            self.relation.config().clone(),
        )
        .await?;
        if let Some(col) = lengths.state.columns.get_mut(&new_alias) {
            col.set_init_transform(init_transform);
        }
        Ok(lengths)
    }
}
