//! Authorization decisions and the decision-source seam.
//!
//! A decision source answers "what may this subject see of this resource"
//! with a [`Decision`]; the cache compiles its row filter once per policy
//! version.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error::{Error, Result};
use crate::range::expression::RangeExpression;

/// Monotonic policy version for a tenant and subject.
pub type PolicyVersion = u64;

/// Outcome class of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    /// Access granted, possibly narrowed by a row filter.
    Allow,
    /// Access denied; every row is filtered out.
    Deny,
}

/// Column-level restriction attached to a decision.
///
/// Applied to projections and result rows, never to the row filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnConstraint {
    #[serde(default)]
    allow_columns: BTreeSet<String>,
    #[serde(default)]
    deny_columns: BTreeSet<String>,
}

impl ColumnConstraint {
    /// Constraint from allow and deny lists; names are lowercased.
    pub fn new<A, D>(allow: A, deny: D) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        Self {
            allow_columns: normalize(allow),
            deny_columns: normalize(deny),
        }
    }

    /// Allowed columns, lowercased. Empty means "all not denied".
    pub fn allow_columns(&self) -> &BTreeSet<String> {
        &self.allow_columns
    }

    /// Denied columns, lowercased.
    pub fn deny_columns(&self) -> &BTreeSet<String> {
        &self.deny_columns
    }

    /// True when the constraint restricts anything.
    pub fn is_effective(&self) -> bool {
        !self.allow_columns.is_empty() || !self.deny_columns.is_empty()
    }

    /// Whether `column` survives the constraint.
    pub fn allows(&self, column: &str) -> bool {
        let column = column.trim().to_ascii_lowercase();
        if self.deny_columns.contains(&column) {
            return false;
        }
        self.allow_columns.is_empty() || self.allow_columns.contains(&column)
    }

    /// Constraint allowing every column either side allows.
    ///
    /// An ineffective side allows everything, so the union is unrestricted.
    pub fn union(&self, other: &ColumnConstraint) -> ColumnConstraint {
        if !self.is_effective() || !other.is_effective() {
            return ColumnConstraint::default();
        }
        let either = |column: &String| self.allows(column) || other.allows(column);
        if !self.allow_columns.is_empty() && !other.allow_columns.is_empty() {
            return ColumnConstraint {
                allow_columns: self
                    .allow_columns
                    .iter()
                    .chain(&other.allow_columns)
                    .filter(|c| either(c))
                    .cloned()
                    .collect(),
                deny_columns: BTreeSet::new(),
            };
        }
        // A deny-only side admits everything outside its deny list.
        ColumnConstraint {
            allow_columns: BTreeSet::new(),
            deny_columns: self
                .deny_columns
                .iter()
                .chain(&other.deny_columns)
                .filter(|c| !either(c))
                .cloned()
                .collect(),
        }
    }

    /// Drop every key of `row` the constraint does not allow.
    pub fn retain_allowed(&self, row: &mut Map<String, Json>) {
        if self.is_effective() {
            row.retain(|key, _| self.allows(key));
        }
    }
}

fn normalize<I>(columns: I) -> BTreeSet<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    columns
        .into_iter()
        .map(|c| c.as_ref().trim().to_ascii_lowercase())
        .filter(|c| !c.is_empty())
        .collect()
}

/// A decision for one subject, resource and action.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    /// Allow or deny.
    pub decision_type: DecisionType,
    /// Row filter; `None` on ALLOW means unrestricted rows.
    pub row_filter: Option<RangeExpression>,
    /// Optional column restriction.
    pub column_constraint: Option<ColumnConstraint>,
}

impl Decision {
    /// ALLOW with an optional row filter.
    pub fn allow(row_filter: Option<RangeExpression>) -> Self {
        Self {
            decision_type: DecisionType::Allow,
            row_filter,
            column_constraint: None,
        }
    }

    /// DENY; any row filter is irrelevant.
    pub fn deny() -> Self {
        Self {
            decision_type: DecisionType::Deny,
            row_filter: None,
            column_constraint: None,
        }
    }

    /// Attach a column constraint.
    pub fn with_column_constraint(mut self, constraint: ColumnConstraint) -> Self {
        self.column_constraint = Some(constraint);
        self
    }

    /// True for DENY.
    pub fn is_deny(&self) -> bool {
        self.decision_type == DecisionType::Deny
    }
}

/// Kind of principal a request runs as.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubjectType {
    /// Human user.
    #[default]
    User,
    /// Service or API client.
    Client,
    /// Anonymous caller.
    Anonymous,
}

/// Statement action a decision is requested for.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    /// Reads.
    #[default]
    Query,
    /// Inserts.
    Create,
    /// Updates.
    Update,
    /// Deletes.
    Delete,
}

impl Action {
    /// Stable upper-case code.
    pub fn code(self) -> &'static str {
        match self {
            Action::Query => "QUERY",
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "QUERY" | "SELECT" | "READ" => Ok(Action::Query),
            "CREATE" | "INSERT" => Ok(Action::Create),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            other => Err(Error::InvalidDeclaration {
                message: format!("unknown action `{other}`"),
            }),
        }
    }
}

/// Who is asking: tenant, subject and free-form attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessContext {
    /// Tenant identifier.
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Subject identifier.
    #[serde(default)]
    pub subject_id: Option<String>,
    /// Principal kind.
    #[serde(default)]
    pub subject_type: SubjectType,
    /// Attributes available to rule placeholders.
    #[serde(default)]
    pub attributes: BTreeMap<String, Json>,
}

impl AccessContext {
    /// Context for a tenant and subject.
    pub fn new(tenant_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            subject_id: Some(subject_id.into()),
            ..Self::default()
        }
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Non-blank tenant, or [`Error::MissingContext`].
    pub fn require_tenant(&self) -> Result<&str> {
        non_blank(self.tenant_id.as_deref()).ok_or(Error::MissingContext("tenant"))
    }

    /// Non-blank subject, or [`Error::MissingContext`].
    pub fn require_subject(&self) -> Result<&str> {
        non_blank(self.subject_id.as_deref()).ok_or(Error::MissingContext("subject"))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Arguments of [`AuthorizationDecisionSource::authorize`].
#[derive(Debug, Clone, Copy)]
pub struct AuthorizeRequest<'a> {
    /// Tenant identifier.
    pub tenant_id: &'a str,
    /// Subject identifier.
    pub subject_id: &'a str,
    /// Resource code.
    pub resource: &'a str,
    /// Requested action.
    pub action: Action,
    /// Full access context, including attributes.
    pub access: &'a AccessContext,
}

/// External authority that produces decisions and policy versions.
pub trait AuthorizationDecisionSource: Send + Sync {
    /// Current policy version for `tenant_id` and `subject_id`.
    fn policy_version(&self, tenant_id: &str, subject_id: &str) -> Result<PolicyVersion>;

    /// Decision for the request; `None` when no policy applies.
    fn authorize(&self, request: &AuthorizeRequest<'_>) -> Result<Option<Decision>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unions_allow_what_either_side_allows() {
        let ids = ColumnConstraint::new(["id", "amount"], ["amount"]);
        let depts = ColumnConstraint::new(["dept_id"], Vec::<String>::new());
        let both = ids.union(&depts);
        assert!(both.allows("id") && both.allows("dept_id"));
        assert!(!both.allows("amount"));

        let no_salary = ColumnConstraint::new(Vec::<String>::new(), ["salary", "amount"]);
        let mixed = no_salary.union(&ids);
        assert!(mixed.allows("id") && mixed.allows("status"));
        assert!(!mixed.allows("salary") && !mixed.allows("amount"));

        assert!(!ids.union(&ColumnConstraint::default()).is_effective());
    }

    #[test]
    fn column_constraint_denies_before_allowing() {
        let constraint = ColumnConstraint::new(["ID", "Name", "salary"], ["salary"]);
        assert!(constraint.is_effective());
        assert!(constraint.allows("name"));
        assert!(!constraint.allows("SALARY"));
        assert!(!constraint.allows("email"));
        assert!(!ColumnConstraint::default().is_effective());
    }

    #[test]
    fn retain_allowed_strips_result_rows() {
        let constraint = ColumnConstraint::new(Vec::<&str>::new(), ["password"]);
        let mut row = serde_json::json!({"id": 1, "PASSWORD": "x", "name": "a"})
            .as_object()
            .cloned()
            .unwrap();
        constraint.retain_allowed(&mut row);
        assert_eq!(row.len(), 2);
        assert!(!row.contains_key("PASSWORD"));
    }

    #[test]
    fn action_parses_sql_verbs_and_codes() {
        assert_eq!("select".parse::<Action>().unwrap(), Action::Query);
        assert_eq!("INSERT".parse::<Action>().unwrap(), Action::Create);
        assert_eq!(Action::Delete.to_string(), "DELETE");
        assert!("merge".parse::<Action>().is_err());
    }

    #[test]
    fn blank_context_values_are_missing() {
        let access = AccessContext {
            tenant_id: Some(" ".to_string()),
            subject_id: Some("u1".to_string()),
            ..AccessContext::default()
        };
        assert!(matches!(
            access.require_tenant(),
            Err(Error::MissingContext("tenant"))
        ));
        assert_eq!(access.require_subject().unwrap(), "u1");
    }
}
