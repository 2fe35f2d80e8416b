use serde_json::Value as Json;
use sqlparser::ast::{BinaryOperator, Expr};

use crate::decision::AccessContext;
use crate::error::{Error, Result};
use crate::parser::expr::{number_literal, string_literal};
use crate::range::expression::{LogicalOperator, RangeExpression};
use crate::registry::ResourceRegistry;
use crate::rules::{CombineType, PredicateDef, PredicateType, RuleDef, RuleSet};

/// Compiles a [`RuleSet`] into a [`RangeExpression`].
///
/// Rules are emitted by descending priority and ORed; each rule joins its
/// predicates with its own connective. Every field resolves through the
/// registry, so an undeclared field fails compilation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleCompiler;

impl RuleCompiler {
    /// Compiler instance.
    pub fn new() -> Self {
        Self
    }

    /// Compile `rule_set` for `access`.
    pub fn compile(
        &self,
        rule_set: &RuleSet,
        access: &AccessContext,
        registry: &dyn ResourceRegistry,
    ) -> Result<RangeExpression> {
        let resource = rule_set.resource.as_str();
        if rule_set.rules.is_empty() {
            return Err(Error::invalid_rule(resource, "rule set is empty"));
        }

        let mut sorted: Vec<&RuleDef> = rule_set.rules.iter().collect();
        sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut compiled = Vec::with_capacity(sorted.len());
        for rule in sorted {
            if rule.predicates.is_empty() {
                continue;
            }
            let predicates = rule
                .predicates
                .iter()
                .map(|p| self.predicate(resource, p, access, registry))
                .collect::<Result<Vec<_>>>()?;
            let op = match rule.combine {
                CombineType::And => LogicalOperator::And,
                CombineType::Or => LogicalOperator::Or,
            };
            compiled.extend(RangeExpression::combine(op, predicates));
        }

        RangeExpression::combine(LogicalOperator::Or, compiled)
            .ok_or_else(|| Error::invalid_rule(resource, "no rule produced a predicate"))
    }

    fn predicate(
        &self,
        resource: &str,
        predicate: &PredicateDef,
        access: &AccessContext,
        registry: &dyn ResourceRegistry,
    ) -> Result<RangeExpression> {
        let column = registry.resolve_column(resource, &predicate.field_key)?.to_expr();
        let values = resolve_values(resource, &predicate.values, access)?;
        let kind = predicate.kind.name();
        let arity_error = |expected: &str| {
            Error::invalid_rule(
                resource,
                format!(
                    "{kind} on `{}` needs {expected} value(s), got {}",
                    predicate.field_key,
                    values.len()
                ),
            )
        };

        let expr = match predicate.kind {
            PredicateType::Eq => {
                let [value] = values.as_slice() else {
                    return Err(arity_error("1"));
                };
                Expr::BinaryOp {
                    left: Box::new(column),
                    op: BinaryOperator::Eq,
                    right: Box::new(literal(value)),
                }
            }
            PredicateType::In => {
                if values.is_empty() {
                    return Err(arity_error("at least 1"));
                }
                Expr::InList {
                    expr: Box::new(column),
                    list: values.iter().map(literal).collect(),
                    negated: false,
                }
            }
            PredicateType::Between => {
                let [low, high] = values.as_slice() else {
                    return Err(arity_error("2"));
                };
                let compatible = matches!(
                    (low, high),
                    (Json::Number(_), Json::Number(_)) | (Json::String(_), Json::String(_))
                );
                if !compatible {
                    return Err(Error::invalid_rule(
                        resource,
                        format!("BETWEEN bounds on `{}` have incompatible types", predicate.field_key),
                    ));
                }
                Expr::Between {
                    expr: Box::new(column),
                    negated: false,
                    low: Box::new(literal(low)),
                    high: Box::new(literal(high)),
                }
            }
            PredicateType::Like => {
                let [Json::String(pattern)] = values.as_slice() else {
                    return Err(Error::invalid_rule(
                        resource,
                        format!("LIKE on `{}` needs exactly one string", predicate.field_key),
                    ));
                };
                let pattern = pattern.trim();
                if !is_anchored_like(pattern) {
                    return Err(Error::invalid_rule(
                        resource,
                        format!("LIKE pattern `{pattern}` must be a prefix or suffix match"),
                    ));
                }
                Expr::Like {
                    negated: false,
                    any: false,
                    expr: Box::new(column),
                    pattern: Box::new(string_literal(pattern)),
                    escape_char: None,
                }
            }
        };
        Ok(RangeExpression::leaf(expr))
    }
}

/// Substitute `${variable}` placeholders and flatten arrays.
fn resolve_values(resource: &str, raw: &[Json], access: &AccessContext) -> Result<Vec<Json>> {
    let mut out = Vec::with_capacity(raw.len());
    for value in raw {
        let resolved = match value.as_str().and_then(placeholder) {
            Some(name) => variable(resource, name, access)?,
            None => value.clone(),
        };
        flatten(resource, resolved, &mut out)?;
    }
    Ok(out)
}

fn placeholder(text: &str) -> Option<&str> {
    let name = text.trim().strip_prefix("${")?.strip_suffix('}')?.trim();
    (!name.is_empty()).then_some(name)
}

fn variable(resource: &str, name: &str, access: &AccessContext) -> Result<Json> {
    let builtin = match name {
        "userId" | "subjectId" => Some(access.require_subject()?),
        "tenantId" => Some(access.require_tenant()?),
        _ => None,
    };
    if let Some(value) = builtin {
        return Ok(Json::String(value.to_string()));
    }
    access
        .attributes
        .get(name)
        .cloned()
        .ok_or_else(|| Error::invalid_rule(resource, format!("unknown variable `{name}`")))
}

fn flatten(resource: &str, value: Json, out: &mut Vec<Json>) -> Result<()> {
    match value {
        Json::Array(items) => items
            .into_iter()
            .try_for_each(|item| flatten(resource, item, out)),
        Json::Object(_) => Err(Error::invalid_rule(
            resource,
            "objects are not allowed as predicate values",
        )),
        Json::Null => Err(Error::invalid_rule(
            resource,
            "null is not allowed as a predicate value",
        )),
        scalar => {
            out.push(scalar);
            Ok(())
        }
    }
}

fn literal(value: &Json) -> Expr {
    match value {
        Json::String(s) => string_literal(s.clone()),
        Json::Bool(b) => number_literal(if *b { "1" } else { "0" }),
        other => number_literal(other.to_string()),
    }
}

/// A single `%`, at either end but not both.
fn is_anchored_like(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    match pattern.matches('%').count() {
        0 => true,
        1 => pattern.len() > 1 && (pattern.starts_with('%') || pattern.ends_with('%')),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_must_be_anchored() {
        assert!(is_anchored_like("abc"));
        assert!(is_anchored_like("abc%"));
        assert!(is_anchored_like("%abc"));
        assert!(!is_anchored_like("%"));
        assert!(!is_anchored_like("%abc%"));
        assert!(!is_anchored_like("a%c"));
        assert!(!is_anchored_like(""));
    }

    #[test]
    fn placeholders_need_braces_and_a_name() {
        assert_eq!(placeholder("${userId}"), Some("userId"));
        assert_eq!(placeholder(" ${ dept } "), Some("dept"));
        assert_eq!(placeholder("${}"), None);
        assert_eq!(placeholder("$userId"), None);
    }

    #[test]
    fn values_flatten_and_reject_objects() {
        let access = AccessContext::new("t1", "u1")
            .with_attribute("depts", serde_json::json!([1, [2, 3]]))
            .with_attribute("profile", serde_json::json!({"a": 1}));
        let values = resolve_values(
            "ORDER",
            &[serde_json::json!("${depts}"), serde_json::json!(4)],
            &access,
        )
        .unwrap();
        assert_eq!(values.len(), 4);

        let err = resolve_values("ORDER", &[serde_json::json!("${profile}")], &access).unwrap_err();
        assert_eq!(err.code(), "INVALID_RULE");
        let err = resolve_values("ORDER", &[serde_json::json!("${missing}")], &access).unwrap_err();
        assert_eq!(err.code(), "INVALID_RULE");
    }

    #[test]
    fn booleans_render_as_integers() {
        assert_eq!(literal(&Json::Bool(true)).to_string(), "1");
        assert_eq!(literal(&Json::Bool(false)).to_string(), "0");
        assert_eq!(literal(&serde_json::json!("O'Brien")).to_string(), "'O''Brien'");
    }
}
