//! SQL expression trees.
//!
//! Transformations are built as [`Expr`] values and only rendered to SQL text
//! at the edge, when a statement is sent to the engine. A [`Template`] is an
//! expression containing [`Expr::Current`] placeholders which stand for "the
//! current value of the column being transformed".
//!
//! Callers may still hand in `{}`-templated SQL text; [`Template::parse`]
//! keeps such text as [`Expr::Raw`] fragments around structured placeholders,
//! so both forms compose the same way.

use std::fmt;

use regex::Regex;

use crate::ident::{quote_ident, quote_literal};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Literal::Int(i) if *i < 0 => write!(f, "({i})"),
            Literal::Int(i) => write!(f, "{i}"),
            Literal::Float(x) if *x < 0.0 => write!(f, "({x})"),
            Literal::Float(x) => write!(f, "{x}"),
            Literal::String(s) => write!(f, "{}", quote_literal(s)),
        }
    }
}

impl From<i64> for Literal {
    fn from(i: i64) -> Self {
        Literal::Int(i)
    }
}

impl From<f64> for Literal {
    fn from(x: f64) -> Self {
        Literal::Float(x)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Literal::Bool(b)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Literal::String(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div => 5,
        }
    }

    fn is_associative(&self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::And | BinaryOp::Or
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub expr: Expr,
    pub order: SortOrder,
}

impl OrderKey {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            order: SortOrder::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            order: SortOrder::Desc,
        }
    }
}

/// The `OVER (...)` clause of a window function.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WindowSpec {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderKey>,
}

impl WindowSpec {
    pub fn partition(partition_by: Vec<Expr>) -> Self {
        Self {
            partition_by,
            order_by: Vec::new(),
        }
    }

    pub fn ordered(mut self, order_by: Vec<OrderKey>) -> Self {
        self.order_by = order_by;
        self
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OVER (")?;
        if !self.partition_by.is_empty() {
            write!(f, "PARTITION BY {}", join(&self.partition_by))?;
        }
        if !self.order_by.is_empty() {
            if !self.partition_by.is_empty() {
                write!(f, " ")?;
            }
            let keys: Vec<String> = self
                .order_by
                .iter()
                .map(|k| {
                    let dir = match k.order {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    format!("{} {dir}", k.expr)
                })
                .collect();
            write!(f, "ORDER BY {}", keys.join(", "))?;
        }
        write!(f, ")")
    }
}

/// A piece of caller-supplied SQL text.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// The current value of the column being transformed.
    Current,
    Column(String),
    Literal(Literal),
    /// Bare SQL keyword argument such as `SECOND`.
    Keyword(String),
    Function {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Negate(Box<Expr>),
    Cast {
        expr: Box<Expr>,
        type_name: String,
    },
    Case {
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    /// `<expr> IGNORE NULLS`, only meaningful as a window function argument.
    IgnoreNulls(Box<Expr>),
    Window {
        func: Box<Expr>,
        window: WindowSpec,
    },
    /// `<func> WITHIN GROUP (ORDER BY <order_by>) OVER (...)`
    WithinGroup {
        func: Box<Expr>,
        order_by: Box<Expr>,
        window: WindowSpec,
    },
    Raw(Vec<Fragment>),
}

impl Expr {
    pub fn column(name: impl Into<String>) -> Self {
        Expr::Column(name.into())
    }

    pub fn int(value: i64) -> Self {
        Expr::Literal(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Literal(Literal::Float(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(Literal::String(value.into()))
    }

    pub fn keyword(word: impl Into<String>) -> Self {
        Expr::Keyword(word.into())
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn add(self, other: Expr) -> Self {
        Expr::binary(self, BinaryOp::Add, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn sub(self, other: Expr) -> Self {
        Expr::binary(self, BinaryOp::Sub, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn mul(self, other: Expr) -> Self {
        Expr::binary(self, BinaryOp::Mul, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn div(self, other: Expr) -> Self {
        Expr::binary(self, BinaryOp::Div, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        Expr::binary(self, BinaryOp::Lt, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn neg(self) -> Self {
        Expr::Negate(Box::new(self))
    }

    pub fn cast(self, type_name: impl Into<String>) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            type_name: type_name.into(),
        }
    }

    pub fn case_when(branches: Vec<(Expr, Expr)>, otherwise: Option<Expr>) -> Self {
        Expr::Case {
            branches,
            otherwise: otherwise.map(Box::new),
        }
    }

    pub fn ignore_nulls(self) -> Self {
        Expr::IgnoreNulls(Box::new(self))
    }

    pub fn over(self, window: WindowSpec) -> Self {
        Expr::Window {
            func: Box::new(self),
            window,
        }
    }

    pub fn within_group(self, order_by: Expr, window: WindowSpec) -> Self {
        Expr::WithinGroup {
            func: Box::new(self),
            order_by: Box::new(order_by),
            window,
        }
    }

    /// Visit this node and every sub-expression, depth first.
    pub fn walk<F>(&self, visitor: &mut F)
    where
        F: FnMut(&Expr),
    {
        visitor(self);
        match self {
            Expr::Current | Expr::Column(_) | Expr::Literal(_) | Expr::Keyword(_) => {}
            Expr::Function { args, .. } => args.iter().for_each(|a| a.walk(visitor)),
            Expr::Binary { left, right, .. } => {
                left.walk(visitor);
                right.walk(visitor);
            }
            Expr::Negate(e) | Expr::IgnoreNulls(e) | Expr::Cast { expr: e, .. } => e.walk(visitor),
            Expr::Case {
                branches,
                otherwise,
            } => {
                for (when, then) in branches {
                    when.walk(visitor);
                    then.walk(visitor);
                }
                if let Some(e) = otherwise {
                    e.walk(visitor);
                }
            }
            Expr::Window { func, window } => {
                func.walk(visitor);
                walk_window(window, visitor);
            }
            Expr::WithinGroup {
                func,
                order_by,
                window,
            } => {
                func.walk(visitor);
                order_by.walk(visitor);
                walk_window(window, visitor);
            }
            Expr::Raw(fragments) => {
                for fragment in fragments {
                    if let Fragment::Expr(e) = fragment {
                        e.walk(visitor);
                    }
                }
            }
        }
    }

    /// Rebuild the tree, replacing every [`Expr::Current`] with `f(Current)`.
    pub fn map_current<F>(&self, f: &F) -> Expr
    where
        F: Fn() -> Expr,
    {
        let map = |e: &Expr| Box::new(e.map_current(f));
        match self {
            Expr::Current => f(),
            Expr::Column(_) | Expr::Literal(_) | Expr::Keyword(_) => self.clone(),
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.map_current(f)).collect(),
            },
            Expr::Binary { left, op, right } => Expr::Binary {
                left: map(left),
                op: *op,
                right: map(right),
            },
            Expr::Negate(e) => Expr::Negate(map(e)),
            Expr::IgnoreNulls(e) => Expr::IgnoreNulls(map(e)),
            Expr::Cast { expr, type_name } => Expr::Cast {
                expr: map(expr),
                type_name: type_name.clone(),
            },
            Expr::Case {
                branches,
                otherwise,
            } => Expr::Case {
                branches: branches
                    .iter()
                    .map(|(w, t)| (w.map_current(f), t.map_current(f)))
                    .collect(),
                otherwise: otherwise.as_ref().map(|e| map(e)),
            },
            Expr::Window { func, window } => Expr::Window {
                func: map(func),
                window: map_window(window, f),
            },
            Expr::WithinGroup {
                func,
                order_by,
                window,
            } => Expr::WithinGroup {
                func: map(func),
                order_by: map(order_by),
                window: map_window(window, f),
            },
            Expr::Raw(fragments) => Expr::Raw(
                fragments
                    .iter()
                    .map(|fragment| match fragment {
                        Fragment::Text(t) => Fragment::Text(t.clone()),
                        Fragment::Expr(e) => Fragment::Expr(e.map_current(f)),
                    })
                    .collect(),
            ),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Raw(fragments) if raw_is_call(fragments) => 7,
            // Unknown shape: always parenthesised when nested in an operator
            Expr::Raw(_) => 0,
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Negate(_) => 6,
            _ => 7,
        }
    }

    fn needs_parens_as_operand(&self) -> bool {
        self.precedence() < 6
    }
}

fn walk_window<F>(window: &WindowSpec, visitor: &mut F)
where
    F: FnMut(&Expr),
{
    window.partition_by.iter().for_each(|e| e.walk(visitor));
    window.order_by.iter().for_each(|k| k.expr.walk(visitor));
}

fn map_window<F>(window: &WindowSpec, f: &F) -> WindowSpec
where
    F: Fn() -> Expr,
{
    WindowSpec {
        partition_by: window
            .partition_by
            .iter()
            .map(|e| e.map_current(f))
            .collect(),
        order_by: window
            .order_by
            .iter()
            .map(|k| OrderKey {
                expr: k.expr.map_current(f),
                order: k.order,
            })
            .collect(),
    }
}

/// Whether raw SQL is a single call such as `ABS({})`, with the closing
/// parenthesis of the call ending the text.
fn raw_is_call(fragments: &[Fragment]) -> bool {
    let text: String = fragments
        .iter()
        .map(|fragment| match fragment {
            Fragment::Text(t) => t.as_str(),
            Fragment::Expr(_) => "x",
        })
        .collect();
    let text = text.trim();
    let name_len = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    if name_len == 0 || !text[name_len..].starts_with('(') {
        return false;
    }

    let mut depth = 0usize;
    let mut in_string = false;
    for (i, c) in text.char_indices().skip(name_len) {
        match c {
            '\'' => in_string = !in_string,
            '(' if !in_string => depth += 1,
            ')' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1 == text.len();
                }
            }
            _ => {}
        }
    }
    false
}

fn join(exprs: &[Expr]) -> String {
    exprs
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, parens: bool) -> fmt::Result {
    if parens {
        write!(f, "({expr})")
    } else {
        write!(f, "{expr}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Current => write!(f, "{{}}"),
            Expr::Column(name) => write!(f, "{}", quote_ident(name)),
            Expr::Literal(lit) => write!(f, "{lit}"),
            Expr::Keyword(word) => write!(f, "{word}"),
            Expr::Function { name, args } => write!(f, "{name}({})", join(args)),
            Expr::Binary { left, op, right } => {
                let left_parens = left.precedence() < op.precedence();
                let right_parens = match right.as_ref() {
                    Expr::Binary { op: inner, .. } if inner.precedence() == op.precedence() => {
                        !(inner == op && op.is_associative())
                    }
                    r => r.precedence() < op.precedence(),
                };
                write_operand(f, left, left_parens)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right, right_parens)
            }
            Expr::Negate(e) => {
                write!(f, "-")?;
                write_operand(f, e, e.needs_parens_as_operand())
            }
            Expr::Cast { expr, type_name } => {
                write_operand(f, expr, expr.needs_parens_as_operand())?;
                write!(f, "::{type_name}")
            }
            Expr::Case {
                branches,
                otherwise,
            } => {
                write!(f, "CASE")?;
                for (when, then) in branches {
                    write!(f, " WHEN {when} THEN {then}")?;
                }
                if let Some(e) = otherwise {
                    write!(f, " ELSE {e}")?;
                }
                write!(f, " END")
            }
            Expr::IgnoreNulls(e) => write!(f, "{e} IGNORE NULLS"),
            Expr::Window { func, window } => write!(f, "{func} {window}"),
            Expr::WithinGroup {
                func,
                order_by,
                window,
            } => write!(f, "{func} WITHIN GROUP (ORDER BY {order_by}) {window}"),
            Expr::Raw(fragments) => {
                for fragment in fragments {
                    match fragment {
                        Fragment::Text(t) => write!(f, "{t}")?,
                        Fragment::Expr(e) => write_operand(f, e, e.precedence() < 7)?,
                    }
                }
                Ok(())
            }
        }
    }
}

/// An expression over "the current value" of a column.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    expr: Expr,
}

impl Template {
    pub fn new(expr: Expr) -> Self {
        Self { expr }
    }

    /// `{}`: leaves the value unchanged. Used to pad chains.
    pub fn identity() -> Self {
        Self::new(Expr::Current)
    }

    /// Parse `{}`-templated SQL text such as `"DECODE({}, NULL, 0, 1)"`.
    pub fn parse(sql: &str) -> Self {
        if sql.trim() == "{}" {
            return Self::identity();
        }
        let mut fragments = Vec::new();
        let mut pieces = sql.split("{}").peekable();
        while let Some(piece) = pieces.next() {
            if !piece.is_empty() {
                fragments.push(Fragment::Text(piece.to_string()));
            }
            if pieces.peek().is_some() {
                fragments.push(Fragment::Expr(Expr::Current));
            }
        }
        Self::new(Expr::Raw(fragments))
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.expr, Expr::Current)
    }

    pub fn has_placeholder(&self) -> bool {
        let mut found = false;
        self.expr.walk(&mut |e| found |= matches!(e, Expr::Current));
        found
    }

    /// Substitute `value` for every placeholder.
    pub fn apply_to(&self, value: &Expr) -> Expr {
        self.expr.map_current(&|| value.clone())
    }

    /// Render the template against the column `alias`.
    pub fn render_for(&self, alias: &str) -> String {
        self.apply_to(&Expr::column(alias)).to_string()
    }

    /// Same template, with every placeholder cast to `type_name` first.
    pub fn cast_placeholder(&self, type_name: &str) -> Template {
        Template::new(
            self.expr
                .map_current(&|| Expr::Current.cast(type_name.to_string())),
        )
    }

    /// Whether the template refers to the column `name`.
    ///
    /// Structured column nodes are compared directly; raw SQL text is
    /// searched for `name` as a whole token or in its quoted form.
    pub fn references(&self, name: &str) -> bool {
        let quoted = format!("\"{}\"", name.replace('"', "\"\""));
        let token = Regex::new(&format!(
            r"(?i)(?:^|[^A-Za-z0-9_]){}(?:$|[^A-Za-z0-9_])",
            regex::escape(name)
        ))
        .ok();

        let mut found = false;
        self.expr.walk(&mut |e| match e {
            Expr::Column(c) => found |= c.eq_ignore_ascii_case(name),
            Expr::Raw(fragments) => {
                for fragment in fragments {
                    if let Fragment::Text(text) = fragment {
                        found |= text.contains(&quoted)
                            || token.as_ref().is_some_and(|re| re.is_match(text));
                    }
                }
            }
            _ => {}
        });
        found
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)
    }
}

impl From<Expr> for Template {
    fn from(expr: Expr) -> Self {
        Template::new(expr)
    }
}

impl From<&str> for Template {
    fn from(sql: &str) -> Self {
        Template::parse(sql)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_keeps_placeholder_structure() {
        let t = Template::parse("DECODE({}, NULL, 0, 1)");
        assert!(t.has_placeholder());
        assert_eq!(t.to_string(), "DECODE({}, NULL, 0, 1)");
        assert_eq!(t.render_for("boat"), "DECODE(boat, NULL, 0, 1)");
        assert!(Template::parse("{}").is_identity());
        assert!(!Template::parse("AVG(x) OVER ()").has_placeholder());
    }

    #[test]
    fn test_binary_parenthesisation() {
        let a = Expr::column("a");
        let b = Expr::column("b");
        let c = Expr::column("c");
        assert_eq!(
            a.clone().sub(b.clone().sub(c.clone())).to_string(),
            "a - (b - c)"
        );
        assert_eq!(
            a.clone().sub(b.clone()).sub(c.clone()).to_string(),
            "a - b - c"
        );
        assert_eq!(
            a.clone().add(b.clone()).mul(c.clone()).to_string(),
            "(a + b) * c"
        );
        assert_eq!(
            a.clone().add(b.clone().mul(c.clone())).to_string(),
            "a + b * c"
        );
        assert_eq!(a.clone().div(b.clone().mul(c)).to_string(), "a / (b * c)");
        assert_eq!(a.add(b).neg().to_string(), "-(a + b)");
    }

    #[test]
    fn test_negative_literals_are_wrapped() {
        let t = Template::new(Expr::Current.add(Expr::int(-5)));
        assert_eq!(t.render_for("val"), "val + (-5)");
    }

    #[test]
    fn test_window_rendering() {
        let e = Expr::func("AVG", vec![Expr::column("x")]).over(WindowSpec::default());
        assert_eq!(e.to_string(), "AVG(x) OVER ()");

        let e = Expr::func("LAG", vec![Expr::column("x"), Expr::int(1)]).over(
            WindowSpec::partition(vec![Expr::column("g")])
                .ordered(vec![OrderKey::asc(Expr::column("t"))]),
        );
        assert_eq!(e.to_string(), "LAG(x, 1) OVER (PARTITION BY g ORDER BY t ASC)");

        let e = Expr::func("PERCENTILE_CONT", vec![Expr::float(0.25)])
            .within_group(Expr::column("x"), WindowSpec::default());
        assert_eq!(
            e.to_string(),
            "PERCENTILE_CONT(0.25) WITHIN GROUP (ORDER BY x) OVER ()"
        );
    }

    #[test]
    fn test_cast_placeholder_in_raw_text() {
        let t = Template::parse("COALESCE({}, 0)").cast_placeholder("int");
        assert_eq!(t.to_string(), "COALESCE({}::int, 0)");
        assert_eq!(t.render_for("flag"), "COALESCE(flag::int, 0)");
    }

    #[test]
    fn test_apply_to_parenthesises_substituted_operators() {
        let inner = Expr::column("x").add(Expr::int(1));
        let t = Template::new(Expr::Current.mul(Expr::int(2)));
        assert_eq!(t.apply_to(&inner).to_string(), "(x + 1) * 2");
    }

    #[test]
    fn test_raw_text_wraps_substituted_operators() {
        let plus_one = Template::parse("{} + 1");
        let double = Template::parse("{} * 2");
        let value = double.apply_to(&plus_one.apply_to(&Expr::column("val")));
        assert_eq!(value.to_string(), "(val + 1) * 2");

        let abs = Template::parse("ABS({})").apply_to(&Expr::column("val"));
        assert_eq!(plus_one.apply_to(&abs).to_string(), "ABS(val) + 1");
        assert_eq!(
            Template::new(Expr::Current.mul(Expr::int(2)))
                .apply_to(&abs)
                .to_string(),
            "ABS(val) * 2"
        );

        let windowed = Template::parse("AVG({}) OVER ()").apply_to(&Expr::column("x"));
        assert_eq!(double.apply_to(&windowed).to_string(), "(AVG(x) OVER ()) * 2");
        let quoted = Template::parse("CONCAT({}, ')')").apply_to(&Expr::column("s"));
        assert_eq!(plus_one.apply_to(&quoted).to_string(), "CONCAT(s, ')') + 1");
    }

    #[test]
    fn test_references() {
        let t = Template::parse("{} * price + \"unit cost\"");
        assert!(t.references("price"));
        assert!(t.references("PRICE"));
        assert!(t.references("unit cost"));
        assert!(!t.references("pri"));
        assert!(!t.references("price_2"));

        let structured = Template::new(Expr::Current.sub(Expr::column("x_mean_1")));
        assert!(structured.references("x_mean_1"));
        assert!(!structured.references("x"));
    }
}
