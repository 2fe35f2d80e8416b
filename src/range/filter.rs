use std::collections::BTreeSet;
use std::fmt;
use std::ops::ControlFlow;

use sqlparser::ast::{visit_expressions, visit_relations, Expr};

use crate::error::{Error, Result};
use crate::parser::expr::{self, collect_column_references, qualify_columns};
use crate::parser::names::object_relation_name;
use crate::range::expression::{LogicalOperator, RangeExpression};

/// A validated boolean filter, ready to be ANDed onto a host query.
///
/// Only [`RangeFilterBuilder`] implementations and
/// [`RangeFilter::always_false`] produce values of this type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeFilter(Expr);

impl RangeFilter {
    pub(crate) fn new(expr: Expr) -> Self {
        Self(expr)
    }

    /// The fixed deny filter `1 = 0`.
    pub fn always_false() -> Self {
        Self(expr::always_false())
    }

    /// True for the deny filter.
    pub fn is_always_false(&self) -> bool {
        expr::is_always_false(&self.0)
    }

    /// Borrow the underlying expression.
    pub fn expr(&self) -> &Expr {
        &self.0
    }

    /// Take the underlying expression.
    pub fn into_expr(self) -> Expr {
        self.0
    }

    /// Render for a table reference in a statement.
    ///
    /// Columns are qualified with `alias` when the table is aliased and with
    /// the table name otherwise, so the filter stays unambiguous in joins.
    pub fn qualified_for(&self, table: &str, alias: Option<&str>) -> Expr {
        let mut expr = self.0.clone();
        qualify_columns(&mut expr, table, alias.unwrap_or(table));
        expr
    }
}

impl fmt::Display for RangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a filter may reference: the resource's tables and column whitelist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilterContext {
    resource: String,
    tables: BTreeSet<String>,
    allowed_columns: BTreeSet<String>,
}

impl RangeFilterContext {
    /// Context for `resource`; table and column names are lowercased.
    pub fn new(
        resource: impl Into<String>,
        tables: impl IntoIterator<Item = String>,
        allowed_columns: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            tables: tables.into_iter().map(|t| t.to_ascii_lowercase()).collect(),
            allowed_columns: allowed_columns
                .into_iter()
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Context with no tables and an empty whitelist; rejects every column.
    pub fn empty(resource: impl Into<String>) -> Self {
        Self::new(resource, Vec::new(), Vec::new())
    }

    /// Resource code.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Declared tables, lowercased.
    pub fn tables(&self) -> &BTreeSet<String> {
        &self.tables
    }

    /// Whitelisted columns, lowercased.
    pub fn allowed_columns(&self) -> &BTreeSet<String> {
        &self.allowed_columns
    }

    /// Case-insensitive whitelist check.
    pub fn allows_column(&self, column: &str) -> bool {
        self.allowed_columns.contains(&column.to_ascii_lowercase())
    }

    /// Case-insensitive table ownership check.
    pub fn owns_table(&self, table: &str) -> bool {
        self.tables.contains(&table.to_ascii_lowercase())
    }
}

/// Lowers a [`RangeExpression`] into a validated [`RangeFilter`].
pub trait RangeFilterBuilder: Send + Sync {
    /// `Ok(None)` means "append nothing" and is only returned for `None`
    /// input. Any identifier outside the context is an error.
    fn build(
        &self,
        expression: Option<&RangeExpression>,
        context: &RangeFilterContext,
    ) -> Result<Option<RangeFilter>>;
}

/// [`RangeFilterBuilder`] targeting `sqlparser` expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlRangeFilterBuilder;

impl SqlRangeFilterBuilder {
    /// Builder instance.
    pub fn new() -> Self {
        Self
    }

    fn lower(
        expression: &RangeExpression,
        context: &RangeFilterContext,
        violations: &mut Violations,
    ) -> Expr {
        match expression {
            RangeExpression::Leaf(leaf) => {
                violations.inspect(leaf, context);
                leaf.clone()
            }
            RangeExpression::Binary { op, left, right } => {
                let left = Self::lower(left, context, violations);
                let right = Self::lower(right, context, violations);
                match op {
                    LogicalOperator::And => expr::and(left, right),
                    LogicalOperator::Or => expr::or(left, right),
                }
            }
            RangeExpression::Not(inner) => expr::not(Self::lower(inner, context, violations)),
        }
    }
}

impl RangeFilterBuilder for SqlRangeFilterBuilder {
    fn build(
        &self,
        expression: Option<&RangeExpression>,
        context: &RangeFilterContext,
    ) -> Result<Option<RangeFilter>> {
        let Some(expression) = expression else {
            return Ok(None);
        };
        let mut violations = Violations::default();
        let lowered = Self::lower(expression, context, &mut violations);
        violations.into_result(context)?;
        Ok(Some(RangeFilter::new(lowered)))
    }
}

/// Everything wrong with a tree, gathered across all of its leaves.
#[derive(Debug, Default)]
struct Violations {
    foreign_table: Option<String>,
    function: Option<String>,
    unauthorized: BTreeSet<String>,
}

impl Violations {
    fn inspect(&mut self, leaf: &Expr, context: &RangeFilterContext) {
        // Subqueries read relations; a leaf may only ever see its own row.
        let _ = visit_relations(leaf, |name| {
            self.foreign_table
                .get_or_insert_with(|| object_relation_name(name));
            ControlFlow::<()>::Break(())
        });

        let _ = visit_expressions(leaf, |e| {
            if let Expr::Function(function) = e {
                self.function.get_or_insert_with(|| function.name.to_string());
                return ControlFlow::<()>::Break(());
            }
            ControlFlow::Continue(())
        });

        for reference in collect_column_references(leaf) {
            if let Some(qualifier) = reference.qualifier.as_deref() {
                if !context.owns_table(qualifier) {
                    self.foreign_table.get_or_insert_with(|| qualifier.to_string());
                }
            }
            if !context.allows_column(&reference.column) {
                self.unauthorized.insert(reference.column);
            }
        }
    }

    fn into_result(self, context: &RangeFilterContext) -> Result<()> {
        let resource = context.resource().to_string();
        if let Some(table) = self.foreign_table {
            return Err(Error::CrossResourceReference { resource, table });
        }
        if let Some(function) = self.function {
            return Err(Error::UnsupportedExpression {
                resource,
                expression: format!("{function}(...)"),
            });
        }
        if !self.unauthorized.is_empty() {
            return Err(Error::UnauthorizedColumnReference {
                resource,
                columns: self.unauthorized.into_iter().collect(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_context() -> RangeFilterContext {
        RangeFilterContext::new(
            "ORDER",
            vec!["t_order".to_string()],
            vec!["dept_id".to_string(), "Owner_Id".to_string()],
        )
    }

    #[test]
    fn none_means_append_nothing() {
        let built = SqlRangeFilterBuilder.build(None, &order_context()).unwrap();
        assert!(built.is_none());
    }

    #[test]
    fn whitelist_is_case_insensitive() {
        let expression = RangeExpression::parse_leaf("OWNER_ID = 7").unwrap();
        let built = SqlRangeFilterBuilder
            .build(Some(&expression), &order_context())
            .unwrap()
            .unwrap();
        assert_eq!(built.to_string(), "OWNER_ID = 7");
    }

    #[test]
    fn subqueries_are_cross_resource() {
        let expression =
            RangeExpression::parse_leaf("dept_id IN (SELECT dept_id FROM t_dept)").unwrap();
        let err = SqlRangeFilterBuilder
            .build(Some(&expression), &order_context())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::CrossResourceReference { ref table, .. } if table == "t_dept"
        ));
    }

    #[test]
    fn function_calls_are_rejected() {
        let expression =
            RangeExpression::parse_leaf("dept_id = 10 OR pg_sleep(10) IS NOT NULL").unwrap();
        let err = SqlRangeFilterBuilder
            .build(Some(&expression), &order_context())
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_EXPRESSION");
    }

    #[test]
    fn qualified_for_uses_alias_then_table() {
        let expression = RangeExpression::parse_leaf("t_order.dept_id = 10 AND owner_id = 1").unwrap();
        let filter = SqlRangeFilterBuilder
            .build(Some(&expression), &order_context())
            .unwrap()
            .unwrap();
        assert_eq!(
            filter.qualified_for("t_order", Some("o")).to_string(),
            "o.dept_id = 10 AND o.owner_id = 1"
        );
        assert_eq!(
            filter.qualified_for("t_order", None).to_string(),
            "t_order.dept_id = 10 AND t_order.owner_id = 1"
        );
    }

    #[test]
    fn always_false_renders_the_deny_predicate() {
        let filter = RangeFilter::always_false();
        assert!(filter.is_always_false());
        assert_eq!(filter.to_string(), "1 = 0");
    }
}
