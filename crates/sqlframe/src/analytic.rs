//! Analytic (window) functions.
//!
//! An [`AnalyticRequest`] names one [`AnalyticFunc`] together with its
//! columns, partition and ordering. [`AnalyticRequest::compile`] turns it into
//! an [`AnalyticPlan`]: the ordered list of columns to create or transform,
//! including the hidden scratch columns some statistics need (skewness, for
//! instance, is computed from per-partition mean, standard deviation and
//! count columns). Compilation is pure; [`Relation::analytic`] runs the plan
//! and either commits all of it or none of it.

use std::fmt;
use std::str::FromStr;

use tracing::{info, instrument, warn};

use crate::error::{FrameError, Result};
use crate::expr::{Expr, OrderKey, SortOrder, Template, WindowSpec};
use crate::ident::generated_name;
use crate::relation::Relation;

/// Order-independent aggregates, computed per partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Max,
    Min,
    Avg,
    Sum,
    Count,
    Stddev,
    Median,
    Variance,
    /// Number of distinct values
    Unique,
    Range,
    Iqr,
    /// Standard error of the mean
    Sem,
}

/// Statistics computed from intermediate scratch columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moment {
    Skewness,
    Kurtosis,
    JarqueBera,
    /// Average absolute deviation
    Aad,
    /// Median absolute deviation
    Mad,
}

/// Order-dependent functions. All of them need an `order_by`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ranking {
    Lead { offset: i64 },
    Lag { offset: i64 },
    RowNumber,
    PercentRank,
    DenseRank,
    Rank,
    FirstValue,
    LastValue,
    PctChange,
    ExponentialMovingAverage { smoothing: f64 },
}

impl Ranking {
    fn takes_column(&self) -> bool {
        !matches!(
            self,
            Ranking::RowNumber | Ranking::PercentRank | Ranking::DenseRank | Ranking::Rank
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairwise {
    Corr,
    Cov,
    Beta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalyticFunc {
    Aggregate(Aggregate),
    Moment(Moment),
    Ranking(Ranking),
    Pairwise(Pairwise),
    /// Fraction in (0, 1], e.g. `0.5` for `"50%"`.
    Percentile(f64),
    /// Most frequent value per partition, optionally with its frequency.
    Top { add_count: bool },
    Prod,
    /// Any other window function, sent to the engine as is.
    Generic(String),
}

impl AnalyticFunc {
    fn is_order_independent(&self) -> bool {
        !matches!(self, AnalyticFunc::Ranking(_) | AnalyticFunc::Generic(_))
    }
}

impl fmt::Display for AnalyticFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalyticFunc::Aggregate(a) => match a {
                Aggregate::Max => "max",
                Aggregate::Min => "min",
                Aggregate::Avg => "avg",
                Aggregate::Sum => "sum",
                Aggregate::Count => "count",
                Aggregate::Stddev => "stddev",
                Aggregate::Median => "median",
                Aggregate::Variance => "variance",
                Aggregate::Unique => "unique",
                Aggregate::Range => "range",
                Aggregate::Iqr => "iqr",
                Aggregate::Sem => "sem",
            },
            AnalyticFunc::Moment(m) => match m {
                Moment::Skewness => "skewness",
                Moment::Kurtosis => "kurtosis",
                Moment::JarqueBera => "jb",
                Moment::Aad => "aad",
                Moment::Mad => "mad",
            },
            AnalyticFunc::Ranking(r) => match r {
                Ranking::Lead { .. } => "lead",
                Ranking::Lag { .. } => "lag",
                Ranking::RowNumber => "row_number",
                Ranking::PercentRank => "percent_rank",
                Ranking::DenseRank => "dense_rank",
                Ranking::Rank => "rank",
                Ranking::FirstValue => "first_value",
                Ranking::LastValue => "last_value",
                Ranking::PctChange => "pct_change",
                Ranking::ExponentialMovingAverage { .. } => "exponential_moving_average",
            },
            AnalyticFunc::Pairwise(p) => match p {
                Pairwise::Corr => "corr",
                Pairwise::Cov => "cov",
                Pairwise::Beta => "beta",
            },
            AnalyticFunc::Percentile(fraction) => {
                let percent = (fraction * 100.0 * 1e6).round() / 1e6;
                return write!(f, "{percent}%");
            }
            AnalyticFunc::Top { .. } => "top",
            AnalyticFunc::Prod => "prod",
            AnalyticFunc::Generic(name) => name.as_str(),
        };
        write!(f, "{name}")
    }
}

impl FromStr for AnalyticFunc {
    type Err = FrameError;

    /// Parse a function name. Names ending in `%` are percentiles; any
    /// other unknown name becomes [`AnalyticFunc::Generic`].
    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_lowercase();
        if let Some(prefix) = name.strip_suffix('%') {
            let fraction = prefix
                .trim()
                .parse::<f64>()
                .map(|p| p / 100.0)
                .ok()
                .filter(|f| *f > 0.0 && *f <= 1.0)
                .ok_or_else(|| {
                    FrameError::InvalidParameter(format!(
                        "The aggregate function '{s}' doesn't exist. To compute the \
                         percentile x of a column write 'x%' with 0 < x <= 100, \
                         e.g. '50%' for the median"
                    ))
                })?;
            return Ok(AnalyticFunc::Percentile(fraction));
        }
        let func = match name.as_str() {
            "max" => AnalyticFunc::Aggregate(Aggregate::Max),
            "min" => AnalyticFunc::Aggregate(Aggregate::Min),
            "avg" | "mean" => AnalyticFunc::Aggregate(Aggregate::Avg),
            "sum" => AnalyticFunc::Aggregate(Aggregate::Sum),
            "count" => AnalyticFunc::Aggregate(Aggregate::Count),
            "stddev" | "std" => AnalyticFunc::Aggregate(Aggregate::Stddev),
            "median" => AnalyticFunc::Aggregate(Aggregate::Median),
            "variance" | "var" => AnalyticFunc::Aggregate(Aggregate::Variance),
            "unique" | "nunique" => AnalyticFunc::Aggregate(Aggregate::Unique),
            "range" => AnalyticFunc::Aggregate(Aggregate::Range),
            "iqr" => AnalyticFunc::Aggregate(Aggregate::Iqr),
            "sem" => AnalyticFunc::Aggregate(Aggregate::Sem),
            "skewness" | "skew" => AnalyticFunc::Moment(Moment::Skewness),
            "kurtosis" | "kurt" => AnalyticFunc::Moment(Moment::Kurtosis),
            "jb" | "jarque_bera" => AnalyticFunc::Moment(Moment::JarqueBera),
            "aad" => AnalyticFunc::Moment(Moment::Aad),
            "mad" => AnalyticFunc::Moment(Moment::Mad),
            "lead" => AnalyticFunc::Ranking(Ranking::Lead { offset: 1 }),
            "lag" => AnalyticFunc::Ranking(Ranking::Lag { offset: 1 }),
            "row_number" => AnalyticFunc::Ranking(Ranking::RowNumber),
            "percent_rank" => AnalyticFunc::Ranking(Ranking::PercentRank),
            "dense_rank" => AnalyticFunc::Ranking(Ranking::DenseRank),
            "rank" => AnalyticFunc::Ranking(Ranking::Rank),
            "first_value" => AnalyticFunc::Ranking(Ranking::FirstValue),
            "last_value" => AnalyticFunc::Ranking(Ranking::LastValue),
            "pct_change" => AnalyticFunc::Ranking(Ranking::PctChange),
            "exponential_moving_average" | "ema" => {
                AnalyticFunc::Ranking(Ranking::ExponentialMovingAverage { smoothing: 0.5 })
            }
            "corr" => AnalyticFunc::Pairwise(Pairwise::Corr),
            "cov" => AnalyticFunc::Pairwise(Pairwise::Cov),
            "beta" => AnalyticFunc::Pairwise(Pairwise::Beta),
            "top" => AnalyticFunc::Top { add_count: true },
            "prod" | "product" => AnalyticFunc::Prod,
            "" => {
                return Err(FrameError::InvalidParameter(
                    "the analytic function name is empty".to_string(),
                ))
            }
            other => AnalyticFunc::Generic(other.to_string()),
        };
        Ok(func)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticRequest {
    pub func: AnalyticFunc,
    pub columns: Vec<String>,
    pub by: Vec<String>,
    pub order_by: Vec<(String, SortOrder)>,
    pub name: Option<String>,
}

impl AnalyticRequest {
    pub fn new(func: AnalyticFunc) -> Self {
        Self {
            func,
            columns: Vec::new(),
            by: Vec::new(),
            order_by: Vec::new(),
            name: None,
        }
    }

    pub fn parse(func: &str) -> Result<Self> {
        Ok(Self::new(func.parse()?))
    }

    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn by<I, S>(mut self, by: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.by = by.into_iter().map(Into::into).collect();
        self
    }

    /// Ascending ordering on each of `columns`.
    pub fn order_by<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_by = columns
            .into_iter()
            .map(|c| (c.into(), SortOrder::Asc))
            .collect();
        self
    }

    pub fn order_by_keys(mut self, keys: Vec<(String, SortOrder)>) -> Self {
        self.order_by = keys;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// `func_columns_by_partition_order_by_keys`, lower-cased.
    pub fn default_name(&self) -> String {
        let mut parts = vec![self.func.to_string()];
        parts.extend(self.columns.iter().cloned());
        if !self.by.is_empty() {
            parts.push("by".to_string());
            parts.extend(self.by.iter().cloned());
        }
        if !self.order_by.is_empty() {
            parts.push("order_by".to_string());
            parts.extend(self.order_by.iter().map(|(c, _)| c.clone()));
        }
        generated_name(parts)
    }

    fn partition(&self) -> WindowSpec {
        WindowSpec::partition(self.by.iter().map(|c| Expr::column(c.clone())).collect())
    }

    fn ordered_partition(&self) -> WindowSpec {
        self.partition().ordered(
            self.order_by
                .iter()
                .map(|(c, order)| OrderKey {
                    expr: Expr::column(c.clone()),
                    order: *order,
                })
                .collect(),
        )
    }

    fn first_column(&self) -> Result<&str> {
        self.columns.first().map(String::as_str).ok_or_else(|| {
            FrameError::MissingColumn(format!(
                "The parameter 'columns' must name a column when using analytic method '{}'",
                self.func
            ))
        })
    }

    /// Compile into the steps creating column `output`.
    ///
    /// `scratch(column, stat)` must return a fresh name for each scratch
    /// column. Every validation error is raised here, before any SQL runs.
    pub fn compile<F>(&self, output: &str, mut scratch: F) -> Result<AnalyticPlan>
    where
        F: FnMut(&str, &str) -> String,
    {
        let mut plan = AnalyticPlan::new(output);
        plan.ignored_order_by = self.func.is_order_independent() && !self.order_by.is_empty();
        let window = self.partition();

        match &self.func {
            AnalyticFunc::Aggregate(aggregate) => {
                let x = Expr::column(self.first_column()?);
                plan.eval(output, aggregate_expr(*aggregate, x, &window));
            }
            AnalyticFunc::Moment(moment) => {
                let column = self.first_column()?;
                self.compile_moment(*moment, column, &window, &mut plan, &mut scratch);
            }
            AnalyticFunc::Percentile(fraction) => {
                if !(*fraction > 0.0 && *fraction <= 1.0) {
                    return Err(FrameError::InvalidParameter(format!(
                        "percentile fraction must be in (0, 1], got {fraction}"
                    )));
                }
                let x = Expr::column(self.first_column()?);
                plan.eval(output, percentile(*fraction, x, &window));
            }
            AnalyticFunc::Top { add_count } => {
                let column = self.first_column()?;
                let x = Expr::column(column);
                let mut by_column = window.clone();
                by_column.partition_by.push(x.clone());
                plan.eval(output, Expr::func("ROW_NUMBER", vec![]).over(by_column));
                let most_frequent_first =
                    window.clone().ordered(vec![OrderKey::desc(Expr::Current)]);
                if *add_count {
                    let count_name = format!("{output}_count");
                    let by_rank = window
                        .clone()
                        .ordered(vec![OrderKey::desc(Expr::column(output))]);
                    plan.eval(
                        &count_name,
                        Expr::func("NTH_VALUE", vec![Expr::column(output), Expr::int(1)])
                            .over(by_rank),
                    );
                    plan.exclude.push(count_name);
                }
                plan.steps.push(PlanStep::Apply {
                    column: output.to_string(),
                    template: Template::new(
                        Expr::func("NTH_VALUE", vec![x, Expr::int(1)]).over(most_frequent_first),
                    ),
                });
            }
            AnalyticFunc::Prod => {
                let x = Expr::column(self.first_column()?);
                plan.eval(output, product(x, &window));
            }
            AnalyticFunc::Ranking(ranking) => {
                let expr = self.compile_ranking(*ranking)?;
                plan.eval(output, expr);
            }
            AnalyticFunc::Pairwise(pairwise) => {
                if self.columns.len() != 2 {
                    return Err(FrameError::MissingColumn(format!(
                        "The parameter 'columns' must name exactly 2 columns when using \
                         analytic method '{}', got {}",
                        self.func,
                        self.columns.len()
                    )));
                }
                let expr = pairwise_expr(*pairwise, &self.columns[0], &self.columns[1], &window);
                plan.eval(output, expr);
            }
            AnalyticFunc::Generic(name) => {
                let valid = !name.is_empty()
                    && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
                if !valid {
                    return Err(FrameError::UnknownAggregate(name.clone()));
                }
                let args = self
                    .columns
                    .first()
                    .map(|c| vec![Expr::column(c.clone())])
                    .unwrap_or_default();
                plan.eval(
                    output,
                    Expr::func(name.to_uppercase(), args).over(self.ordered_partition()),
                );
            }
        }
        Ok(plan)
    }

    fn compile_moment<F>(
        &self,
        moment: Moment,
        column: &str,
        window: &WindowSpec,
        plan: &mut AnalyticPlan,
        scratch: &mut F,
    ) where
        F: FnMut(&str, &str) -> String,
    {
        let x = Expr::column(column);
        let output = plan.output.clone();
        let over = |name: &str, arg: Expr| Expr::func(name, vec![arg]).over(window.clone());

        if moment == Moment::Mad {
            let median = scratch(column, "median");
            plan.scratch(&median, over("MEDIAN", x.clone()));
            let deviation = Expr::func("ABS", vec![x.sub(Expr::column(median))]);
            plan.eval(&output, over("MEDIAN", deviation));
            return;
        }

        let mean = scratch(column, "mean");
        plan.scratch(&mean, over("AVG", x.clone()));
        if moment == Moment::Aad {
            let deviation = Expr::func("ABS", vec![x.sub(Expr::column(mean))]);
            plan.eval(&output, over("AVG", deviation));
            return;
        }

        let std = scratch(column, "std");
        let count = scratch(column, "count");
        plan.scratch(&std, over("STDDEV", x.clone()));
        plan.scratch(&count, over("COUNT", x.clone()));

        let moments = Moments {
            x,
            mean: Expr::column(mean),
            std: Expr::column(std),
            n: Expr::column(count),
            window: window.clone(),
        };
        let expr = match moment {
            Moment::Skewness => moments.skewness(),
            Moment::Kurtosis => moments.kurtosis(),
            _ => moments.jarque_bera(),
        };
        plan.eval(&output, expr);
    }

    fn compile_ranking(&self, ranking: Ranking) -> Result<Expr> {
        if ranking.takes_column() {
            self.first_column()?;
        } else if !self.columns.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "The parameter 'columns' must be empty when using analytic method '{}'",
                self.func
            )));
        }
        if self.order_by.is_empty() {
            return Err(FrameError::InvalidParameter(format!(
                "The analytic method '{}' requires an 'order_by'",
                self.func
            )));
        }
        let window = self.ordered_partition();
        let x = || {
            self.columns
                .first()
                .map(|c| Expr::column(c.clone()))
                .unwrap_or(Expr::Current)
        };
        let call = |name: &str, args: Vec<Expr>| Expr::func(name, args).over(window.clone());

        let expr = match ranking {
            Ranking::Lead { offset } => call("LEAD", vec![x(), Expr::int(offset)]),
            Ranking::Lag { offset } => call("LAG", vec![x(), Expr::int(offset)]),
            Ranking::RowNumber => call("ROW_NUMBER", vec![]),
            Ranking::PercentRank => call("PERCENT_RANK", vec![]),
            Ranking::DenseRank => call("DENSE_RANK", vec![]),
            Ranking::Rank => call("RANK", vec![]),
            Ranking::FirstValue => call("FIRST_VALUE", vec![x().ignore_nulls()]),
            Ranking::LastValue => call("LAST_VALUE", vec![x().ignore_nulls()]),
            Ranking::PctChange => x().div(call("LAG", vec![x()])),
            Ranking::ExponentialMovingAverage { smoothing } => {
                if !(0.0..=1.0).contains(&smoothing) {
                    return Err(FrameError::InvalidParameter(format!(
                        "The smoothing factor must be between 0 and 1, got {smoothing}"
                    )));
                }
                call(
                    "EXPONENTIAL_MOVING_AVERAGE",
                    vec![x(), Expr::float(smoothing)],
                )
            }
        };
        Ok(expr)
    }
}

fn aggregate_expr(aggregate: Aggregate, x: Expr, window: &WindowSpec) -> Expr {
    let over = |name: &str, arg: Expr| Expr::func(name, vec![arg]).over(window.clone());
    match aggregate {
        Aggregate::Unique => {
            let rank = |order: OrderKey| {
                Expr::func("DENSE_RANK", vec![]).over(window.clone().ordered(vec![order]))
            };
            rank(OrderKey::asc(x.clone()))
                .add(rank(OrderKey::desc(x)))
                .sub(Expr::int(1))
        }
        Aggregate::Range => over("MAX", x.clone()).sub(over("MIN", x)),
        Aggregate::Iqr => percentile(0.75, x.clone(), window).sub(percentile(0.25, x, window)),
        Aggregate::Sem => over("STDDEV", x.clone()).div(Expr::func("SQRT", vec![over("COUNT", x)])),
        Aggregate::Max => over("MAX", x),
        Aggregate::Min => over("MIN", x),
        Aggregate::Avg => over("AVG", x),
        Aggregate::Sum => over("SUM", x),
        Aggregate::Count => over("COUNT", x),
        Aggregate::Stddev => over("STDDEV", x),
        Aggregate::Median => over("MEDIAN", x),
        Aggregate::Variance => over("VARIANCE", x),
    }
}

fn percentile(fraction: f64, x: Expr, window: &WindowSpec) -> Expr {
    Expr::func("PERCENTILE_CONT", vec![Expr::float(fraction)]).within_group(x, window.clone())
}

/// Product over the partition through logarithms, with the sign restored
/// from the parity of the count of negative values.
fn product(x: Expr, window: &WindowSpec) -> Expr {
    let negatives = Expr::func(
        "SUM",
        vec![Expr::case_when(
            vec![(x.clone().lt(Expr::int(0)), Expr::int(1))],
            Some(Expr::int(0)),
        )],
    )
    .over(window.clone());
    let sign = Expr::func(
        "DECODE",
        vec![
            Expr::func("ABS", vec![Expr::func("MOD", vec![negatives, Expr::int(2)])]),
            Expr::int(0),
            Expr::int(1),
            Expr::int(-1),
        ],
    );
    let log_sum = Expr::func(
        "SUM",
        vec![Expr::func("LOG", vec![Expr::func("ABS", vec![x])])],
    )
    .over(window.clone());
    sign.mul(Expr::func("POWER", vec![Expr::int(10), log_sum]))
}

fn pairwise_expr(pairwise: Pairwise, a: &str, b: &str, window: &WindowSpec) -> Expr {
    let over = |name: &str, arg: Expr| Expr::func(name, vec![arg]).over(window.clone());
    let (x, y) = (Expr::column(a), Expr::column(b));
    if a == b {
        return match pairwise {
            Pairwise::Cov => over("VARIANCE", x),
            Pairwise::Corr | Pairwise::Beta => Expr::int(1),
        };
    }
    let covariance = over("AVG", x.clone().mul(y.clone()))
        .sub(over("AVG", x.clone()).mul(over("AVG", y.clone())));
    match pairwise {
        Pairwise::Cov => covariance,
        Pairwise::Corr => covariance.div(over("STDDEV", x).mul(over("STDDEV", y))),
        Pairwise::Beta => covariance.div(over("VARIANCE", y)),
    }
}

/// Building blocks of the bias-corrected skewness and kurtosis estimators.
struct Moments {
    x: Expr,
    mean: Expr,
    std: Expr,
    n: Expr,
    window: WindowSpec,
}

impl Moments {
    fn nullifzero(e: Expr) -> Expr {
        Expr::func("NULLIFZERO", vec![e])
    }

    fn power(e: Expr, p: i64) -> Expr {
        Expr::func("POWER", vec![e, Expr::int(p)])
    }

    fn n_minus(&self, k: i64) -> Expr {
        self.n.clone().sub(Expr::int(k))
    }

    /// `AVG(POWER((x - mean) / NULLIFZERO(std), k)) OVER (...)`
    fn standardized(&self, k: i64) -> Expr {
        let z = self
            .x
            .clone()
            .sub(self.mean.clone())
            .div(Self::nullifzero(self.std.clone()));
        Expr::func("AVG", vec![Self::power(z, k)]).over(self.window.clone())
    }

    fn skewness(&self) -> Expr {
        self.standardized(3)
            .mul(Self::power(self.n.clone(), 2))
            .div(Self::nullifzero(self.n_minus(1).mul(self.n_minus(2))))
    }

    fn kurtosis(&self) -> Expr {
        let leading = self
            .standardized(4)
            .mul(Self::power(self.n.clone(), 2))
            .mul(self.n.clone().add(Expr::int(1)))
            .div(Self::nullifzero(
                self.n_minus(1).mul(self.n_minus(2)).mul(self.n_minus(3)),
            ));
        let correction = Expr::int(3)
            .mul(Self::power(self.n_minus(1), 2))
            .div(Self::nullifzero(self.n_minus(2).mul(self.n_minus(3))));
        leading.sub(correction)
    }

    fn jarque_bera(&self) -> Expr {
        let terms = Self::power(self.skewness(), 2)
            .add(Self::power(self.kurtosis(), 2).div(Expr::int(4)));
        self.n.clone().div(Expr::int(6)).mul(terms)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    /// Create column `name` from `expr`.
    Eval { name: String, expr: Expr },
    /// Extend the chain of an existing column.
    Apply { column: String, template: Template },
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::Eval { name, expr } => write!(f, "{name} := {expr}"),
            PlanStep::Apply { column, template } => write!(f, "{column} := {template}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalyticPlan {
    pub output: String,
    pub steps: Vec<PlanStep>,
    /// Aliases to hide once every step has succeeded.
    pub exclude: Vec<String>,
    /// An `order_by` was given to an order-independent function.
    pub ignored_order_by: bool,
}

impl AnalyticPlan {
    fn new(output: &str) -> Self {
        Self {
            output: output.to_string(),
            steps: Vec::new(),
            exclude: Vec::new(),
            ignored_order_by: false,
        }
    }

    fn eval(&mut self, name: &str, expr: Expr) {
        self.steps.push(PlanStep::Eval {
            name: name.to_string(),
            expr,
        });
    }

    fn scratch(&mut self, name: &str, expr: Expr) {
        self.eval(name, expr);
        self.exclude.push(name.to_string());
    }

    /// SQL of the step creating the output column.
    pub fn output_expr(&self) -> Option<&Expr> {
        self.steps.iter().find_map(|step| match step {
            PlanStep::Eval { name, expr } if *name == self.output => Some(expr),
            _ => None,
        })
    }
}

impl Relation {
    /// Add a column computed by an analytic function.
    ///
    /// The call is atomic: if any step fails, scratch columns created by
    /// earlier steps are discarded and the relation is left as it was.
    #[instrument(skip(self, request), fields(func = %request.func))]
    pub async fn analytic(&mut self, request: AnalyticRequest) -> Result<&mut Self> {
        let request = self.resolve_request(request)?;
        let output = match &request.name {
            Some(name) => self.ensure_new_name(name)?,
            None => self.ensure_new_name(&request.default_name())?,
        };

        let mut reserved = vec![output.clone()];
        if let AnalyticFunc::Top { add_count: true } = request.func {
            reserved.push(self.ensure_new_name(&format!("{output}_count"))?);
        }

        let snapshot = self.state.clone();
        let plan = match request.compile(&output, |column, stat| {
            self.next_scratch_name(column, stat, &reserved)
        }) {
            Ok(plan) => plan,
            Err(e) => {
                self.state = snapshot;
                return Err(e);
            }
        };
        if plan.ignored_order_by && self.config().warn_on_ignored_order_by {
            warn!(
                "'{}' analytic method doesn't need an order by clause, it was ignored",
                request.func
            );
        }

        if let Err(e) = self.run_plan(&plan).await {
            self.state = snapshot;
            warn!(error = %e, output = %output, "analytic call rolled back");
            return Err(match (&request.func, e) {
                (AnalyticFunc::Generic(name), FrameError::Query { .. }) => {
                    FrameError::UnknownAggregate(name.clone())
                }
                (_, e) => e,
            });
        }

        for alias in &plan.exclude {
            self.exclude(alias);
        }
        self.add_to_history(format!(
            "[Analytic]: The new column '{output}' was added using the analytic function '{}'.",
            request.func
        ));
        info!(output = %output, steps = plan.steps.len(), "Analytic column committed");
        Ok(self)
    }

    fn resolve_request(&self, request: AnalyticRequest) -> Result<AnalyticRequest> {
        let resolve = |names: &[String]| -> Result<Vec<String>> {
            names.iter().map(|n| self.resolve_column(n)).collect()
        };
        let order_by = request
            .order_by
            .iter()
            .map(|(c, order)| Ok((self.resolve_column(c)?, *order)))
            .collect::<Result<Vec<_>>>()?;
        Ok(AnalyticRequest {
            columns: resolve(&request.columns)?,
            by: resolve(&request.by)?,
            order_by,
            ..request
        })
    }

    async fn run_plan(&mut self, plan: &AnalyticPlan) -> Result<()> {
        for step in &plan.steps {
            match step {
                PlanStep::Eval { name, expr } => {
                    self.eval_column(name, &Template::new(expr.clone())).await?;
                }
                PlanStep::Apply { column, template } => {
                    self.apply_transform(column, template, None).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> impl FnMut(&str, &str) -> String {
        let mut n = 0;
        move |column, stat| {
            n += 1;
            format!("{column}_{stat}_{n}")
        }
    }

    fn compile(request: AnalyticRequest) -> Result<AnalyticPlan> {
        let output = request.default_name();
        request.compile(&output, counter())
    }

    fn output_sql(request: AnalyticRequest) -> String {
        compile(request)
            .unwrap()
            .output_expr()
            .map(|e| e.to_string())
            .unwrap_or_default()
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!(
            "mean".parse::<AnalyticFunc>().unwrap(),
            AnalyticFunc::Aggregate(Aggregate::Avg)
        );
        assert_eq!(
            "ema".parse::<AnalyticFunc>().unwrap(),
            AnalyticFunc::Ranking(Ranking::ExponentialMovingAverage { smoothing: 0.5 })
        );
        assert_eq!(
            "25%".parse::<AnalyticFunc>().unwrap(),
            AnalyticFunc::Percentile(0.25)
        );
        assert_eq!(
            "ntile".parse::<AnalyticFunc>().unwrap(),
            AnalyticFunc::Generic("ntile".to_string())
        );
    }

    #[test]
    fn test_malformed_percentile() {
        assert!(matches!(
            "fifty%".parse::<AnalyticFunc>(),
            Err(FrameError::InvalidParameter(_))
        ));
        assert!(matches!(
            "150%".parse::<AnalyticFunc>(),
            Err(FrameError::InvalidParameter(_))
        ));
        assert!(matches!(
            "0%".parse::<AnalyticFunc>(),
            Err(FrameError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_default_name() {
        let request = AnalyticRequest::parse("skewness")
            .unwrap()
            .columns(["x"])
            .by(["g"]);
        assert_eq!(request.default_name(), "skewness_x_by_g");
        let request = AnalyticRequest::parse("lag")
            .unwrap()
            .columns(["x"])
            .order_by(["t"]);
        assert_eq!(request.default_name(), "lag_x_order_by_t");
    }

    #[test]
    fn test_prod_is_log_domain() {
        let sql = output_sql(AnalyticRequest::new(AnalyticFunc::Prod).columns(["x"]).by(["g"]));
        assert!(sql.contains("SUM(LOG(ABS(x)))"), "{sql}");
        assert!(sql.contains("DECODE(ABS(MOD(SUM(CASE WHEN x < 0 THEN 1 ELSE 0 END) OVER (PARTITION BY g), 2))"), "{sql}");
        assert!(sql.contains("POWER(10, SUM(LOG(ABS(x))) OVER (PARTITION BY g))"), "{sql}");
    }

    #[test]
    fn test_degenerate_pairwise() {
        let corr = output_sql(
            AnalyticRequest::new(AnalyticFunc::Pairwise(Pairwise::Corr)).columns(["c", "c"]),
        );
        assert_eq!(corr, "1");
        let cov = output_sql(
            AnalyticRequest::new(AnalyticFunc::Pairwise(Pairwise::Cov))
                .columns(["c", "c"])
                .by(["g"]),
        );
        assert_eq!(cov, "VARIANCE(c) OVER (PARTITION BY g)");
    }

    #[test]
    fn test_corr_formula() {
        let corr = output_sql(
            AnalyticRequest::new(AnalyticFunc::Pairwise(Pairwise::Corr)).columns(["x", "y"]),
        );
        assert_eq!(
            corr,
            "(AVG(x * y) OVER () - AVG(x) OVER () * AVG(y) OVER ()) / \
             (STDDEV(x) OVER () * STDDEV(y) OVER ())"
        );
    }

    #[test]
    fn test_pairwise_needs_two_columns() {
        let err = compile(AnalyticRequest::new(AnalyticFunc::Pairwise(Pairwise::Beta)).columns(["x"]))
            .unwrap_err();
        assert!(matches!(err, FrameError::MissingColumn(_)));
    }

    #[test]
    fn test_skewness_uses_scratch_columns() {
        let plan = compile(AnalyticRequest::parse("skewness").unwrap().columns(["x"]).by(["g"]))
            .unwrap();
        assert_eq!(plan.exclude, vec!["x_mean_1", "x_std_2", "x_count_3"]);
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(
            plan.output_expr().unwrap().to_string(),
            "AVG(POWER((x - x_mean_1) / NULLIFZERO(x_std_2), 3)) OVER (PARTITION BY g) \
             * POWER(x_count_3, 2) / NULLIFZERO((x_count_3 - 1) * (x_count_3 - 2))"
        );
    }

    #[test]
    fn test_kurtosis_formula() {
        let plan = compile(AnalyticRequest::parse("kurtosis").unwrap().columns(["x"])).unwrap();
        assert_eq!(
            plan.output_expr().unwrap().to_string(),
            "AVG(POWER((x - x_mean_1) / NULLIFZERO(x_std_2), 4)) OVER () \
             * POWER(x_count_3, 2) * (x_count_3 + 1) \
             / NULLIFZERO((x_count_3 - 1) * (x_count_3 - 2) * (x_count_3 - 3)) \
             - 3 * POWER(x_count_3 - 1, 2) / NULLIFZERO((x_count_3 - 2) * (x_count_3 - 3))"
        );
    }

    #[test]
    fn test_mad_uses_median_only() {
        let plan = compile(AnalyticRequest::parse("mad").unwrap().columns(["x"])).unwrap();
        assert_eq!(plan.exclude, vec!["x_median_1"]);
        assert_eq!(
            plan.output_expr().unwrap().to_string(),
            "MEDIAN(ABS(x - x_median_1)) OVER ()"
        );
    }

    #[test]
    fn test_top_plan() {
        let plan = compile(
            AnalyticRequest::new(AnalyticFunc::Top { add_count: true })
                .columns(["x"])
                .by(["g"])
                .name("mode_x"),
        )
        .unwrap();
        let steps: Vec<String> = plan.steps.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            steps,
            vec![
                "mode_x := ROW_NUMBER() OVER (PARTITION BY g, x)",
                "mode_x_count := NTH_VALUE(mode_x, 1) OVER (PARTITION BY g ORDER BY mode_x DESC)",
                "mode_x := NTH_VALUE(x, 1) OVER (PARTITION BY g ORDER BY {} DESC)",
            ]
        );
        assert_eq!(plan.exclude, vec!["mode_x_count"]);
    }

    #[test]
    fn test_ranking_validation() {
        let missing_order = compile(AnalyticRequest::parse("lag").unwrap().columns(["x"]));
        assert!(matches!(missing_order, Err(FrameError::InvalidParameter(_))));

        let missing_column = compile(AnalyticRequest::parse("lead").unwrap().order_by(["t"]));
        assert!(matches!(missing_column, Err(FrameError::MissingColumn(_))));

        let extra_column = compile(
            AnalyticRequest::parse("row_number")
                .unwrap()
                .columns(["x"])
                .order_by(["t"]),
        );
        assert!(matches!(extra_column, Err(FrameError::InvalidParameter(_))));

        let smoothing = compile(
            AnalyticRequest::new(AnalyticFunc::Ranking(Ranking::ExponentialMovingAverage {
                smoothing: 1.5,
            }))
            .columns(["x"])
            .order_by(["t"]),
        );
        assert!(matches!(smoothing, Err(FrameError::InvalidParameter(_))));
    }

    #[test]
    fn test_ranking_sql() {
        let lag = output_sql(
            AnalyticRequest::new(AnalyticFunc::Ranking(Ranking::Lag { offset: 2 }))
                .columns(["x"])
                .by(["g"])
                .order_by(["t"]),
        );
        assert_eq!(lag, "LAG(x, 2) OVER (PARTITION BY g ORDER BY t ASC)");

        let first = output_sql(
            AnalyticRequest::parse("first_value")
                .unwrap()
                .columns(["x"])
                .order_by_keys(vec![("t".to_string(), SortOrder::Desc)]),
        );
        assert_eq!(first, "FIRST_VALUE(x IGNORE NULLS) OVER (ORDER BY t DESC)");

        let pct = output_sql(
            AnalyticRequest::parse("pct_change")
                .unwrap()
                .columns(["x"])
                .order_by(["t"]),
        );
        assert_eq!(pct, "x / LAG(x) OVER (ORDER BY t ASC)");
    }

    #[test]
    fn test_order_by_on_aggregate_is_flagged_not_rejected() {
        let plan = compile(
            AnalyticRequest::parse("avg")
                .unwrap()
                .columns(["x"])
                .order_by(["t"]),
        )
        .unwrap();
        assert!(plan.ignored_order_by);
        assert_eq!(plan.output_expr().unwrap().to_string(), "AVG(x) OVER ()");
    }

    #[test]
    fn test_percentile_and_derived_aggregates() {
        let median = output_sql(AnalyticRequest::parse("50%").unwrap().columns(["x"]));
        assert_eq!(median, "PERCENTILE_CONT(0.5) WITHIN GROUP (ORDER BY x) OVER ()");

        let unique = output_sql(AnalyticRequest::parse("nunique").unwrap().columns(["x"]));
        assert_eq!(
            unique,
            "DENSE_RANK() OVER (ORDER BY x ASC) + DENSE_RANK() OVER (ORDER BY x DESC) - 1"
        );

        let sem = output_sql(AnalyticRequest::parse("sem").unwrap().columns(["x"]));
        assert_eq!(sem, "STDDEV(x) OVER () / SQRT(COUNT(x) OVER ())");
    }

    #[test]
    fn test_generic_names_are_checked() {
        let err = compile(AnalyticRequest::parse("drop table").unwrap().columns(["x"])).unwrap_err();
        assert!(matches!(err, FrameError::UnknownAggregate(_)));
        let sql = output_sql(
            AnalyticRequest::parse("ntile")
                .unwrap()
                .columns(["x"])
                .order_by(["t"]),
        );
        assert_eq!(sql, "NTILE(x) OVER (ORDER BY t ASC)");
    }
}
