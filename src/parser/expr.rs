use std::ops::ControlFlow;

use sqlparser::ast::{
    visit_expressions, visit_expressions_mut, BinaryOperator, Expr, Ident, UnaryOperator, Value,
};

use crate::parser::names::{column_qualifier, normalize_identifier};

/// A column referenced somewhere inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ColumnReference {
    /// Lowercased table qualifier, when the reference was qualified.
    pub qualifier: Option<String>,
    /// Column identifier as written.
    pub column: String,
}

/// Every column reference in `expr`, including those nested in function
/// arguments and subqueries, in visit order.
pub fn collect_column_references(expr: &Expr) -> Vec<ColumnReference> {
    let mut refs = Vec::new();
    let _ = visit_expressions(expr, |e| {
        match e {
            Expr::Identifier(ident) => refs.push(ColumnReference {
                qualifier: None,
                column: ident.value.clone(),
            }),
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    refs.push(ColumnReference {
                        qualifier: column_qualifier(parts),
                        column: last.value.clone(),
                    });
                }
            }
            _ => {}
        }
        ControlFlow::<()>::Continue(())
    });
    refs
}

/// Point every column of `expr` at `qualifier`.
///
/// Bare identifiers and references qualified with `table` become
/// `qualifier.col`; references to other tables are left alone.
pub fn qualify_columns(expr: &mut Expr, table: &str, qualifier: &str) {
    let table = normalize_identifier(table);
    let _ = visit_expressions_mut(expr, |e| {
        let column = match e {
            Expr::Identifier(ident) => Some(ident.clone()),
            Expr::CompoundIdentifier(parts)
                if column_qualifier(parts).as_deref() == Some(table.as_str()) =>
            {
                parts.last().cloned()
            }
            _ => None,
        };
        if let Some(column) = column {
            *e = Expr::CompoundIdentifier(vec![Ident::new(qualifier), column]);
        }
        ControlFlow::<()>::Continue(())
    });
}

/// Integer or decimal literal.
pub fn number_literal(text: impl Into<String>) -> Expr {
    Expr::value(Value::Number(text.into(), false))
}

/// Single-quoted string literal; quoting is left to the SQL renderer.
pub fn string_literal(text: impl Into<String>) -> Expr {
    Expr::value(Value::SingleQuotedString(text.into()))
}

/// SQL `NULL`.
pub fn null_literal() -> Expr {
    Expr::value(Value::Null)
}

/// The fixed deny predicate `1 = 0`.
pub fn always_false() -> Expr {
    Expr::BinaryOp {
        left: Box::new(number_literal("1")),
        op: BinaryOperator::Eq,
        right: Box::new(number_literal("0")),
    }
}

/// True when `expr` is exactly [`always_false`].
pub fn is_always_false(expr: &Expr) -> bool {
    *expr == always_false()
}

/// `left AND right`, parenthesizing OR operands.
pub fn and(left: Expr, right: Expr) -> Expr {
    connect(left, BinaryOperator::And, right)
}

/// `left OR right`, parenthesizing AND operands.
pub fn or(left: Expr, right: Expr) -> Expr {
    connect(left, BinaryOperator::Or, right)
}

/// `NOT (inner)`.
pub fn not(inner: Expr) -> Expr {
    let inner = match inner {
        Expr::Nested(_) | Expr::Identifier(_) | Expr::Value(_) => inner,
        other => Expr::Nested(Box::new(other)),
    };
    Expr::UnaryOp {
        op: UnaryOperator::Not,
        expr: Box::new(inner),
    }
}

/// Combine a host filter with a data-scope segment.
///
/// The segment is always ANDed; it never replaces the original filter.
pub fn append_filter(original: Option<Expr>, segment: Option<Expr>) -> Option<Expr> {
    match (original, segment) {
        (Some(original), Some(segment)) => Some(and(original, segment)),
        (original, None) => original,
        (None, segment) => segment,
    }
}

fn connect(left: Expr, op: BinaryOperator, right: Expr) -> Expr {
    let left = operand(left, &op);
    let right = operand(right, &op);
    Expr::BinaryOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

fn operand(expr: Expr, parent: &BinaryOperator) -> Expr {
    match &expr {
        Expr::BinaryOp { op, .. } if is_connective(op) && op != parent => {
            Expr::Nested(Box::new(expr))
        }
        _ => expr,
    }
}

fn is_connective(op: &BinaryOperator) -> bool {
    matches!(op, BinaryOperator::And | BinaryOperator::Or)
}
