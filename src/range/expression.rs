use sqlparser::ast::Expr;

use crate::error::Result;
use crate::parser::sql_parser::parse_condition;

/// Boolean connective of a [`RangeExpression::Binary`] node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOperator {
    /// Both sides must hold.
    And,
    /// Either side may hold.
    Or,
}

/// Row-filtering intent of a policy, before whitelist validation.
///
/// Leaves carry host SQL expressions; nothing in a leaf is trusted until
/// [`RangeFilterBuilder`](crate::range::filter::RangeFilterBuilder) has
/// checked every identifier it references.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RangeExpression {
    /// A single boolean predicate.
    Leaf(Expr),
    /// Two sub-expressions joined by a connective.
    Binary {
        /// Connective.
        op: LogicalOperator,
        /// Left operand.
        left: Box<RangeExpression>,
        /// Right operand.
        right: Box<RangeExpression>,
    },
    /// Negation.
    Not(Box<RangeExpression>),
}

impl RangeExpression {
    /// Wrap a predicate expression.
    pub fn leaf(expr: Expr) -> Self {
        RangeExpression::Leaf(expr)
    }

    /// Parse `sql` as a single predicate leaf.
    pub fn parse_leaf(sql: &str) -> Result<Self> {
        Ok(RangeExpression::Leaf(parse_condition(sql)?))
    }

    /// `left AND right`.
    pub fn and(left: RangeExpression, right: RangeExpression) -> Self {
        RangeExpression::Binary {
            op: LogicalOperator::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `left OR right`.
    pub fn or(left: RangeExpression, right: RangeExpression) -> Self {
        RangeExpression::Binary {
            op: LogicalOperator::Or,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// `NOT inner`.
    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: RangeExpression) -> Self {
        RangeExpression::Not(Box::new(inner))
    }

    /// Fold `parts` left to right with `op`; `None` when empty.
    pub fn combine(
        op: LogicalOperator,
        parts: impl IntoIterator<Item = RangeExpression>,
    ) -> Option<Self> {
        parts.into_iter().reduce(|left, right| match op {
            LogicalOperator::And => RangeExpression::and(left, right),
            LogicalOperator::Or => RangeExpression::or(left, right),
        })
    }

    /// Number of leaves.
    pub fn leaf_count(&self) -> usize {
        match self {
            RangeExpression::Leaf(_) => 1,
            RangeExpression::Binary { left, right, .. } => left.leaf_count() + right.leaf_count(),
            RangeExpression::Not(inner) => inner.leaf_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_folds_left_to_right() {
        let parts = ["a = 1", "b = 2", "c = 3"]
            .into_iter()
            .map(|sql| RangeExpression::parse_leaf(sql).unwrap());
        let combined = RangeExpression::combine(LogicalOperator::Or, parts).unwrap();

        let RangeExpression::Binary { op, left, .. } = &combined else {
            panic!("expected a binary node");
        };
        assert_eq!(*op, LogicalOperator::Or);
        assert!(matches!(**left, RangeExpression::Binary { .. }));
        assert_eq!(combined.leaf_count(), 3);
        assert!(RangeExpression::combine(LogicalOperator::And, Vec::new()).is_none());
    }
}
