//! Declarative rule sets and their compilation into range expressions.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::decision::{Action, ColumnConstraint, DecisionType};

/// Rule-set to range-expression compiler.
pub mod compiler;
/// Rule storage and the rule-backed decision source.
pub mod store;

pub use compiler::RuleCompiler;
pub use store::{InMemoryRuleStore, RuleStore, RuleStoreDecisionSource};

/// All rules one policy holds for a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    /// Resource code the rules filter.
    pub resource: String,
    /// Actions the set applies to; empty means every action.
    #[serde(default)]
    pub actions: Vec<Action>,
    /// ALLOW narrows rows with `rules`; DENY hides everything.
    #[serde(default = "default_effect")]
    pub effect: DecisionType,
    /// Row rules, ORed together. Empty on ALLOW means all rows.
    #[serde(default)]
    pub rules: Vec<RuleDef>,
    /// Optional column restriction.
    #[serde(default)]
    pub columns: Option<ColumnConstraint>,
}

fn default_effect() -> DecisionType {
    DecisionType::Allow
}

impl RuleSet {
    /// Whether this set governs `resource` under `action`.
    pub fn applies_to(&self, resource: &str, action: Action) -> bool {
        self.resource.eq_ignore_ascii_case(resource)
            && (self.actions.is_empty() || self.actions.contains(&action))
    }
}

/// How a rule joins its predicates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CombineType {
    /// Every predicate must hold.
    #[default]
    And,
    /// Any predicate may hold.
    Or,
}

/// One row rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDef {
    /// Higher priorities are emitted first.
    #[serde(default)]
    pub priority: i32,
    /// Predicate connective.
    #[serde(default)]
    pub combine: CombineType,
    /// Predicates over registered fields.
    #[serde(default)]
    pub predicates: Vec<PredicateDef>,
}

/// Comparison a predicate performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PredicateType {
    /// `column = v`
    Eq,
    /// `column IN (v, ..)`
    In,
    /// `column BETWEEN a AND b`
    Between,
    /// `column LIKE 'prefix%'` or `'%suffix'`
    Like,
}

impl PredicateType {
    /// Upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            PredicateType::Eq => "EQ",
            PredicateType::In => "IN",
            PredicateType::Between => "BETWEEN",
            PredicateType::Like => "LIKE",
        }
    }
}

/// A predicate over a logical field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredicateDef {
    /// Field key, resolved through the registry.
    #[serde(alias = "fieldKey")]
    pub field_key: String,
    /// Comparison.
    #[serde(rename = "type")]
    pub kind: PredicateType,
    /// Literal values or `${variable}` placeholders.
    #[serde(default)]
    pub values: Vec<Json>,
}

impl PredicateDef {
    /// Predicate on `field_key`.
    pub fn new(field_key: impl Into<String>, kind: PredicateType, values: Vec<Json>) -> Self {
        Self {
            field_key: field_key.into(),
            kind,
            values,
        }
    }
}
