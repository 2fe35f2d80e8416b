//! JSON range DSL.
//!
//! ```json
//! {"type": "AND",
//!  "left":  {"type": "COMPARE", "field": "dept_id", "operator": "EQ", "value": 10},
//!  "right": {"type": "NULL", "field": "deleted_at"}}
//! ```
//!
//! Nodes: `AND`/`OR` (`left`, `right`), `NOT` (`expression`), `COMPARE`
//! (`field`, `operator`, `value`), `BETWEEN` (`field`, `start`, `end`), `IN`
//! (`field`, `values`, `negated`) and `NULL` (`field`, `negated`). Values are
//! JSON scalars or `{"type": "STRING" | "NUMBER" | "BOOLEAN" | "DATETIME" | "NULL", "value": ..}`.
//! Raw SQL fragments are never accepted; every field must be a plain identifier.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value as Json};
use sqlparser::ast::{BinaryOperator, Expr, Ident, Value};

use crate::error::{Error, Result};
use crate::parser::expr::{null_literal, number_literal, string_literal};
use crate::range::expression::RangeExpression;
use crate::registry::validator::ColumnNameValidator;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parse a JSON DSL document into a [`RangeExpression`].
pub fn parse_range_dsl(dsl: &str) -> Result<RangeExpression> {
    if dsl.trim().is_empty() {
        return Err(Error::invalid_dsl("document is empty"));
    }
    let root: Json = serde_json::from_str(dsl)?;
    DslParser::default().expression(&root)
}

#[derive(Default)]
struct DslParser {
    validator: ColumnNameValidator,
}

impl DslParser {
    fn expression(&self, node: &Json) -> Result<RangeExpression> {
        let Some(object) = node.as_object() else {
            return Err(Error::invalid_dsl("expression must be a JSON object"));
        };

        match node_type(object)?.as_str() {
            "AND" => Ok(RangeExpression::and(
                self.child(object, "left")?,
                self.child(object, "right")?,
            )),
            "OR" => Ok(RangeExpression::or(
                self.child(object, "left")?,
                self.child(object, "right")?,
            )),
            "NOT" => {
                let inner = object
                    .get("expression")
                    .or_else(|| object.get("expr"))
                    .ok_or_else(|| Error::invalid_dsl("NOT requires `expression`"))?;
                Ok(RangeExpression::not(self.expression(inner)?))
            }
            "COMPARE" | "COMPARISON" => self.compare(object, None),
            "BETWEEN" => {
                let field = self.field(object)?;
                Ok(RangeExpression::leaf(Expr::Between {
                    expr: Box::new(field),
                    negated: false,
                    low: Box::new(value(object.get("start"))?),
                    high: Box::new(value(object.get("end"))?),
                }))
            }
            "IN" => {
                let field = self.field(object)?;
                let values = object
                    .get("values")
                    .and_then(Json::as_array)
                    .ok_or_else(|| Error::invalid_dsl("IN requires a `values` array"))?;
                if values.is_empty() {
                    return Err(Error::invalid_dsl("IN requires at least one value"));
                }
                let list = values
                    .iter()
                    .map(|v| value(Some(v)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(RangeExpression::leaf(Expr::InList {
                    expr: Box::new(field),
                    list,
                    negated: negated(object),
                }))
            }
            "NULL" | "IS_NULL" => {
                let field = Box::new(self.field(object)?);
                Ok(RangeExpression::leaf(if negated(object) {
                    Expr::IsNotNull(field)
                } else {
                    Expr::IsNull(field)
                }))
            }
            other if object.contains_key("field") && object.contains_key("value") => {
                self.compare(object, Some(other))
            }
            other => Err(Error::invalid_dsl(format!("unknown node type `{other}`"))),
        }
    }

    fn child(&self, object: &Map<String, Json>, key: &str) -> Result<RangeExpression> {
        let node = object
            .get(key)
            .ok_or_else(|| Error::invalid_dsl(format!("missing `{key}` operand")))?;
        self.expression(node)
    }

    fn field(&self, object: &Map<String, Json>) -> Result<Expr> {
        let field = object
            .get("field")
            .and_then(Json::as_str)
            .ok_or_else(|| Error::invalid_dsl("predicate requires a string `field`"))?;
        self.validator.validate(field)?;
        Ok(Expr::Identifier(Ident::new(field)))
    }

    fn compare(&self, object: &Map<String, Json>, marker: Option<&str>) -> Result<RangeExpression> {
        let field = self.field(object)?;
        let operator = object
            .get("operator")
            .and_then(Json::as_str)
            .or_else(|| object.get("op").and_then(Json::as_str))
            .filter(|op| !op.trim().is_empty())
            .or(marker)
            .ok_or_else(|| Error::invalid_dsl("COMPARE requires an `operator`"))?;
        let right = value(object.get("value"))?;

        let op = match operator.trim().to_ascii_uppercase().as_str() {
            "EQ" | "=" => BinaryOperator::Eq,
            "NE" | "!=" | "<>" => BinaryOperator::NotEq,
            "GT" | ">" => BinaryOperator::Gt,
            "GTE" | ">=" => BinaryOperator::GtEq,
            "LT" | "<" => BinaryOperator::Lt,
            "LTE" | "<=" => BinaryOperator::LtEq,
            "LIKE" => {
                return Ok(RangeExpression::leaf(Expr::Like {
                    negated: false,
                    any: false,
                    expr: Box::new(field),
                    pattern: Box::new(right),
                    escape_char: None,
                }))
            }
            other => {
                return Err(Error::invalid_dsl(format!(
                    "unknown comparison operator `{other}`"
                )))
            }
        };
        Ok(RangeExpression::leaf(Expr::BinaryOp {
            left: Box::new(field),
            op,
            right: Box::new(right),
        }))
    }
}

fn node_type(object: &Map<String, Json>) -> Result<String> {
    let marker = object
        .get("type")
        .or_else(|| object.get("op"))
        .and_then(Json::as_str)
        .map(|s| s.trim().to_ascii_uppercase())
        .filter(|s| !s.is_empty());
    if let Some(marker) = marker {
        return Ok(marker);
    }
    if object.contains_key("left") && object.contains_key("right") {
        return Ok("AND".to_string());
    }
    if object.contains_key("field") && object.contains_key("value") {
        return Ok("COMPARE".to_string());
    }
    Err(Error::invalid_dsl("expression has no `type`"))
}

fn negated(object: &Map<String, Json>) -> bool {
    ["negated", "not"]
        .iter()
        .any(|key| object.get(*key).and_then(Json::as_bool).unwrap_or(false))
}

fn value(node: Option<&Json>) -> Result<Expr> {
    match node {
        None | Some(Json::Null) => Ok(null_literal()),
        Some(Json::String(s)) => Ok(string_literal(s.clone())),
        Some(Json::Number(n)) => Ok(number_literal(n.to_string())),
        Some(Json::Bool(b)) => Ok(Expr::value(Value::Boolean(*b))),
        Some(Json::Object(object)) => typed_value(object),
        Some(Json::Array(_)) => Err(Error::invalid_dsl("arrays are only allowed in IN values")),
    }
}

fn typed_value(object: &Map<String, Json>) -> Result<Expr> {
    let inner = object.get("value");
    let Some(kind) = object.get("type").and_then(Json::as_str) else {
        return match inner {
            Some(Json::Object(_)) => Err(Error::invalid_dsl("nested value objects")),
            other => value(other),
        };
    };

    match (kind.trim().to_ascii_uppercase().as_str(), inner) {
        (_, None | Some(Json::Null)) | ("NULL", _) => Ok(null_literal()),
        ("STRING", Some(Json::String(s))) => Ok(string_literal(s.clone())),
        ("STRING", Some(other)) => Ok(string_literal(other.to_string())),
        ("NUMBER", Some(Json::Number(n))) => Ok(number_literal(n.to_string())),
        ("BOOLEAN", Some(Json::Bool(b))) => Ok(Expr::value(Value::Boolean(*b))),
        ("DATETIME" | "TIMESTAMP", Some(raw)) => datetime(raw),
        (kind, Some(_)) => Err(Error::invalid_dsl(format!(
            "value does not match declared type `{kind}`"
        ))),
    }
}

fn datetime(raw: &Json) -> Result<Expr> {
    let parsed = match raw {
        Json::String(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, DATETIME_FORMAT))
            .map_err(|e| Error::invalid_dsl(format!("invalid datetime `{s}`: {e}")))?,
        Json::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|dt| dt.naive_utc())
            .ok_or_else(|| Error::invalid_dsl(format!("invalid epoch millis `{n}`")))?,
        other => {
            return Err(Error::invalid_dsl(format!(
                "datetime must be a string or epoch millis, got {other}"
            )))
        }
    };
    Ok(string_literal(parsed.format(DATETIME_FORMAT).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(dsl: &str) -> String {
        match parse_range_dsl(dsl).unwrap() {
            RangeExpression::Leaf(expr) => expr.to_string(),
            other => panic!("expected a leaf, got {other:?}"),
        }
    }

    #[test]
    fn comparison_operators_accept_names_and_symbols() {
        assert_eq!(
            render(r#"{"type":"COMPARE","field":"dept_id","operator":"GTE","value":10}"#),
            "dept_id >= 10"
        );
        assert_eq!(
            render(r#"{"field":"status","op":"!=","value":"closed"}"#),
            "status <> 'closed'"
        );
        assert_eq!(
            render(r#"{"type":"COMPARE","field":"name","operator":"like","value":"ab%"}"#),
            "name LIKE 'ab%'"
        );
    }

    #[test]
    fn typed_values_render_as_literals() {
        assert_eq!(
            render(
                r#"{"type":"BETWEEN","field":"created_at",
                    "start":{"type":"DATETIME","value":"2026-01-01T08:00:00"},
                    "end":{"type":"DATETIME","value":0}}"#
            ),
            "created_at BETWEEN '2026-01-01 08:00:00' AND '1970-01-01 00:00:00'"
        );
        assert_eq!(
            render(r#"{"type":"IN","field":"dept_id","values":[1,{"type":"NUMBER","value":2}],"negated":true}"#),
            "dept_id NOT IN (1, 2)"
        );
        assert_eq!(
            render(r#"{"type":"NULL","field":"deleted_at","not":true}"#),
            "deleted_at IS NOT NULL"
        );
    }

    #[test]
    fn logical_nodes_nest() {
        let parsed = parse_range_dsl(
            r#"{"type":"NOT","expression":{"left":{"field":"a","operator":"EQ","value":1},"right":{"field":"b","operator":"EQ","value":2}}}"#,
        );
        let Ok(RangeExpression::Not(inner)) = parsed else {
            panic!("expected NOT");
        };
        assert_eq!(inner.leaf_count(), 2);
    }

    #[test]
    fn comparisons_need_an_operator() {
        let err = parse_range_dsl(r#"{"field":"a","value":1}"#).unwrap_err();
        assert_eq!(err.code(), "INVALID_DSL");
    }

    #[test]
    fn injection_through_field_names_is_rejected() {
        let err = parse_range_dsl(
            r#"{"type":"COMPARE","field":"1=1 OR dept_id","operator":"EQ","value":1}"#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_IDENTIFIER");
    }

    #[test]
    fn malformed_documents_fail() {
        for bad in [
            "",
            "[]",
            r#"{"type":"SQL","sql":"1=1"}"#,
            r#"{"type":"IN","field":"a","values":[]}"#,
            r#"{"type":"COMPARE","field":"a","operator":"~","value":1}"#,
            r#"{"type":"AND","left":{"field":"a","value":1}}"#,
        ] {
            let err = parse_range_dsl(bad).unwrap_err();
            assert!(
                matches!(err.code(), "INVALID_DSL" | "JSON_ERROR"),
                "{bad}: {err}"
            );
        }
    }
}
