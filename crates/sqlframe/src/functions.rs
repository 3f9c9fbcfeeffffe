//! Named scalar functions accepted by [`ColumnMut::apply_fun`].
//!
//! [`ColumnMut::apply_fun`]: crate::ColumnMut::apply_fun

use std::fmt;
use std::str::FromStr;

use sqlframe_api::Category;

use crate::error::FrameError;
use crate::expr::{Expr, Literal, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarFunc {
    Abs,
    Acos,
    Asin,
    Atan,
    Avg,
    Cbrt,
    Ceil,
    Contain,
    Count,
    Cos,
    Cosh,
    Cot,
    Dim,
    Exp,
    Find,
    Floor,
    Len,
    Ln,
    Log,
    Log10,
    Max,
    Min,
    Mod,
    Pow,
    Round,
    Sign,
    Sin,
    Sinh,
    Sum,
    Sqrt,
    Tan,
    Tanh,
}

const NAMES: &[(&str, ScalarFunc)] = &[
    ("abs", ScalarFunc::Abs),
    ("acos", ScalarFunc::Acos),
    ("asin", ScalarFunc::Asin),
    ("atan", ScalarFunc::Atan),
    ("avg", ScalarFunc::Avg),
    ("cbrt", ScalarFunc::Cbrt),
    ("ceil", ScalarFunc::Ceil),
    ("contain", ScalarFunc::Contain),
    ("count", ScalarFunc::Count),
    ("cos", ScalarFunc::Cos),
    ("cosh", ScalarFunc::Cosh),
    ("cot", ScalarFunc::Cot),
    ("dim", ScalarFunc::Dim),
    ("exp", ScalarFunc::Exp),
    ("find", ScalarFunc::Find),
    ("floor", ScalarFunc::Floor),
    ("len", ScalarFunc::Len),
    ("ln", ScalarFunc::Ln),
    ("log", ScalarFunc::Log),
    ("log10", ScalarFunc::Log10),
    ("max", ScalarFunc::Max),
    ("min", ScalarFunc::Min),
    ("mod", ScalarFunc::Mod),
    ("pow", ScalarFunc::Pow),
    ("round", ScalarFunc::Round),
    ("sign", ScalarFunc::Sign),
    ("sin", ScalarFunc::Sin),
    ("sinh", ScalarFunc::Sinh),
    ("sum", ScalarFunc::Sum),
    ("sqrt", ScalarFunc::Sqrt),
    ("tan", ScalarFunc::Tan),
    ("tanh", ScalarFunc::Tanh),
];

impl ScalarFunc {
    pub fn name(&self) -> &'static str {
        NAMES
            .iter()
            .find(|(_, f)| f == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Build the template for a column of `category`. `x` is the second
    /// argument of `log`, `mod`, `pow`, `round`, `contain` and `find`.
    pub fn compile(&self, category: Category, x: &Literal) -> Template {
        let current = || Expr::Current;
        let arg = || Expr::Literal(x.clone());
        let expr = match self {
            ScalarFunc::Len => {
                let name = match category {
                    Category::VMap => "MAPSIZE",
                    Category::Complex => "APPLY_COUNT_ELEMENTS",
                    _ => "LENGTH",
                };
                Expr::func(name, vec![current()])
            }
            ScalarFunc::Max
            | ScalarFunc::Min
            | ScalarFunc::Sum
            | ScalarFunc::Avg
            | ScalarFunc::Count => Expr::func(
                format!("APPLY_{}", self.name().to_uppercase()),
                vec![current()],
            ),
            ScalarFunc::Dim => Expr::func("ARRAY_DIMS", vec![current()]),
            ScalarFunc::Log => Expr::func("LOG", vec![arg(), current()]),
            ScalarFunc::Mod | ScalarFunc::Pow | ScalarFunc::Round => {
                Expr::func(self.name().to_uppercase(), vec![current(), arg()])
            }
            ScalarFunc::Contain => {
                let name = if category == Category::VMap {
                    "MAPCONTAINSVALUE"
                } else {
                    "CONTAINS"
                };
                Expr::func(name, vec![current(), arg()])
            }
            ScalarFunc::Find => Expr::func("ARRAY_FIND", vec![current(), arg()]),
            _ => Expr::func(self.name().to_uppercase(), vec![current()]),
        };
        Template::new(expr)
    }
}

impl fmt::Display for ScalarFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ScalarFunc {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_lowercase();
        let name = match name.as_str() {
            "mean" => "avg",
            "length" => "len",
            other => other,
        };
        NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, f)| *f)
            .ok_or_else(|| FrameError::InvalidParameter(format!("unknown scalar function '{s}'")))
    }
}
