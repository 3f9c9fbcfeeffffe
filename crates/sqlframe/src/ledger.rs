//! The column transform ledger.
//!
//! A [`Column`] never holds data. It holds the chain of SQL rewrites which,
//! replayed in order against the physical source, produce its current
//! value. Chains of columns that reference each other are kept at aligned
//! depths so the relation can be replayed level by level.

use serde::{Deserialize, Serialize};
use sqlframe_api::Category;

use crate::expr::{Expr, Template};

/// One rewrite of a column.
///
/// `template` is `None` at depths where the column does not exist yet.
#[derive(Debug, Clone, PartialEq)]
pub struct TransformStep {
    pub template: Option<Template>,
    pub data_type: String,
    pub category: Category,
}

impl TransformStep {
    pub fn new(template: Template, data_type: impl Into<String>, category: Category) -> Self {
        Self {
            template: Some(template),
            data_type: data_type.into(),
            category,
        }
    }

    pub fn absent(data_type: impl Into<String>, category: Category) -> Self {
        Self {
            template: None,
            data_type: data_type.into(),
            category,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.template.as_ref().is_some_and(Template::is_identity)
    }
}

/// Serializable summary of a step, for display layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub template: Option<String>,
    pub data_type: String,
    pub category: Category,
}

impl From<&TransformStep> for StepSummary {
    fn from(step: &TransformStep) -> Self {
        Self {
            template: step.template.as_ref().map(|t| t.to_string()),
            data_type: step.data_type.clone(),
            category: step.category,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    alias: String,
    /// What the first step is applied to: the physical column for source
    /// columns, the copied column for copies.
    origin: Expr,
    chain: Vec<TransformStep>,
    init_transform: Template,
}

impl Column {
    /// A physical column of the relation's source.
    pub fn from_source(alias: impl Into<String>, data_type: impl Into<String>, category: Category) -> Self {
        let alias = alias.into();
        Self {
            origin: Expr::column(alias.clone()),
            alias,
            chain: vec![TransformStep::new(Template::identity(), data_type, category)],
            init_transform: Template::identity(),
        }
    }

    /// A column defined by an expression over other columns, appearing at
    /// depth `floor`.
    pub fn derived(
        alias: impl Into<String>,
        floor: usize,
        template: Template,
        data_type: impl Into<String>,
        category: Category,
    ) -> Self {
        let data_type = data_type.into();
        let mut chain: Vec<TransformStep> = (0..floor)
            .map(|_| TransformStep::absent(data_type.clone(), category))
            .collect();
        chain.push(TransformStep::new(template.clone(), data_type, category));
        let alias = alias.into();
        Self {
            origin: Expr::column(alias.clone()),
            alias,
            chain,
            init_transform: template,
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn origin(&self) -> &Expr {
        &self.origin
    }

    pub fn chain(&self) -> &[TransformStep] {
        &self.chain
    }

    pub fn summary(&self) -> Vec<StepSummary> {
        self.chain.iter().map(StepSummary::from).collect()
    }

    /// The transform as it was when the column was created.
    pub fn init_transform(&self) -> &Template {
        &self.init_transform
    }

    pub fn depth(&self) -> usize {
        self.chain.len()
    }

    fn last(&self) -> &TransformStep {
        // `chain` is never empty: every constructor pushes a step
        &self.chain[self.chain.len() - 1]
    }

    pub fn data_type(&self) -> &str {
        &self.last().data_type
    }

    pub fn category(&self) -> Category {
        self.last().category
    }

    /// The step replayed at `level`, if the chain reaches that deep.
    pub fn step(&self, level: usize) -> Option<&TransformStep> {
        self.chain.get(level)
    }

    /// The whole chain folded into one expression over the column's origin.
    pub fn expression(&self) -> Expr {
        self.chain
            .iter()
            .filter_map(|step| step.template.as_ref())
            .fold(self.origin.clone(), |value, template| {
                template.apply_to(&value)
            })
    }

    /// Extend the chain with identity steps until it is `floor` long.
    pub(crate) fn pad_to(&mut self, floor: usize) {
        while self.chain.len() < floor {
            let last = self.last();
            let step = TransformStep::new(Template::identity(), last.data_type.clone(), last.category);
            self.chain.push(step);
        }
    }

    pub(crate) fn push(&mut self, step: TransformStep) {
        self.chain.push(step);
    }

    /// Same chain under another alias.
    pub(crate) fn renamed(&self, alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            origin: self.origin.clone(),
            chain: self.chain.clone(),
            init_transform: self.init_transform.clone(),
        }
    }

    pub(crate) fn set_init_transform(&mut self, template: Template) {
        self.init_transform = template;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_column_starts_with_identity() {
        let col = Column::from_source("val", "int", Category::Int);
        assert_eq!(col.depth(), 1);
        assert!(col.chain()[0].is_identity());
        assert_eq!(col.expression().to_string(), "val");
    }

    #[test]
    fn test_expression_folds_chain() {
        let mut col = Column::from_source("val", "int", Category::Int);
        col.push(TransformStep::new(Template::parse("ABS({})"), "int", Category::Int));
        col.push(TransformStep::new(
            Template::new(Expr::Current.add(Expr::int(1))),
            "int",
            Category::Int,
        ));
        assert_eq!(col.expression().to_string(), "ABS(val) + 1");
    }

    #[test]
    fn test_pad_to_repeats_last_type() {
        let mut col = Column::from_source("val", "int", Category::Int);
        col.push(TransformStep::new(Template::parse("{} / 2"), "float", Category::Float));
        col.pad_to(4);
        assert_eq!(col.depth(), 4);
        assert!(col.chain()[2].is_identity());
        assert_eq!(col.chain()[3].data_type, "float");
        col.pad_to(2);
        assert_eq!(col.depth(), 4);
    }

    #[test]
    fn test_derived_is_absent_below_floor() {
        let col = Column::derived(
            "ratio",
            2,
            Template::new(Expr::column("a").div(Expr::column("b"))),
            "float",
            Category::Float,
        );
        assert_eq!(col.depth(), 3);
        assert!(col.step(0).unwrap().template.is_none());
        assert!(col.step(1).unwrap().template.is_none());
        assert_eq!(col.expression().to_string(), "a / b");
        assert_eq!(col.init_transform().to_string(), "a / b");
    }

    #[test]
    fn test_expression_keeps_precedence_of_parsed_steps() {
        let mut col = Column::from_source("val", "int", Category::Int);
        col.push(TransformStep::new(Template::parse("{} + 1"), "int", Category::Int));
        col.push(TransformStep::new(Template::parse("{} * 2"), "int", Category::Int));
        assert_eq!(col.expression().to_string(), "(val + 1) * 2");
    }

    #[test]
    fn test_summary_is_the_serializable_view() {
        let mut col = Column::derived(
            "ratio",
            1,
            Template::new(Expr::column("a").div(Expr::column("b"))),
            "float",
            Category::Float,
        );
        col.push(TransformStep::new(Template::parse("ROUND({}, 2)"), "numeric(10,2)", Category::Float));

        let summary = col.summary();
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].template, None);
        assert_eq!(summary[1].template.as_deref(), Some("a / b"));
        assert_eq!(summary[2].template.as_deref(), Some("ROUND({}, 2)"));
        assert_eq!(summary[2].data_type, "numeric(10,2)");

        let yaml = serde_yaml::to_string(&summary).unwrap();
        assert!(yaml.contains("category: float"), "{yaml}");
        let parsed: Vec<StepSummary> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, summary);
    }

    #[test]
    fn test_renamed_keeps_origin() {
        let mut col = Column::from_source("val", "int", Category::Int);
        col.push(TransformStep::new(Template::parse("ABS({})"), "int", Category::Int));
        let copy = col.renamed("val_abs");
        assert_eq!(copy.alias(), "val_abs");
        assert_eq!(copy.expression().to_string(), "ABS(val)");
    }
}
