//! Error taxonomy shared by the registry, compiler, cache and bridge.
//!
//! Startup errors ([`Error::is_startup`]) abort registry construction. Every
//! other variant is a per-query error that the bridge absorbs into its single
//! fail-closed / fail-open outcome.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, compiling or applying data-scope filters.
#[derive(Debug, Error)]
pub enum Error {
    // Startup errors
    /// An identifier failed the whitelist grammar.
    #[error("invalid identifier `{identifier}`: {reason}")]
    InvalidIdentifier {
        /// The rejected identifier, verbatim.
        identifier: String,
        /// Which rule the identifier broke.
        reason: &'static str,
    },

    /// The same key was registered twice with different targets.
    #[error("conflicting {kind} mapping for `{key}`: `{previous}` vs `{current}`")]
    DuplicateMapping {
        /// Which map the conflict was found in (`statement`, `table`, `field`).
        kind: &'static str,
        /// The duplicated key.
        key: String,
        /// Target registered first.
        previous: String,
        /// Conflicting target registered later.
        current: String,
    },

    /// A registry declaration is structurally incomplete (blank names and similar).
    #[error("invalid registry declaration: {message}")]
    InvalidDeclaration {
        /// Human-readable description of the problem.
        message: String,
    },

    // Per-query errors
    /// Tenant or subject context is absent.
    #[error("missing {0} context")]
    MissingContext(&'static str),

    /// A rule references a field key with no declared column.
    #[error("field `{field_key}` is not registered for resource `{resource}`")]
    UnregisteredField {
        /// Resource the rule targets.
        resource: String,
        /// The unknown field key.
        field_key: String,
    },

    /// A leaf expression names columns outside the resource whitelist.
    #[error(
        "expression references columns outside the whitelist of `{resource}`: {}",
        columns.join(", ")
    )]
    UnauthorizedColumnReference {
        /// Resource whose whitelist was checked.
        resource: String,
        /// Offending column identifiers, sorted and deduplicated.
        columns: Vec<String>,
    },

    /// A leaf expression qualifies a column with a table the resource does not own.
    #[error("expression references table `{table}` which does not belong to resource `{resource}`")]
    CrossResourceReference {
        /// Resource whose tables were checked.
        resource: String,
        /// The foreign table qualifier.
        table: String,
    },

    /// The external decision source failed or timed out.
    #[error("decision source failed: {message}")]
    DecisionSourceFailure {
        /// Failure description reported by the source.
        message: String,
    },

    /// A rule set could not be compiled.
    #[error("invalid rule for `{resource}`: {message}")]
    InvalidRule {
        /// Resource the rule set targets.
        resource: String,
        /// What was wrong with the rule.
        message: String,
    },

    /// The JSON range DSL was malformed.
    #[error("invalid range DSL: {message}")]
    InvalidDsl {
        /// What was wrong with the document.
        message: String,
    },

    /// A range leaf used an expression form filters may not contain.
    #[error("resource {resource}: unsupported expression {expression}")]
    UnsupportedExpression {
        /// Resource the filter was compiled for.
        resource: String,
        /// The offending expression.
        expression: String,
    },

    // Infrastructure errors
    /// SQL text could not be parsed.
    #[error("SQL parse error: {0}")]
    SqlParse(#[from] sqlparser::parser::ParserError),

    /// JSON (configuration, rules, DSL) could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Reading a configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for [`Error::DecisionSourceFailure`].
    pub fn decision_source(message: impl Into<String>) -> Self {
        Error::DecisionSourceFailure {
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::InvalidRule`].
    pub fn invalid_rule(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Error::InvalidRule {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Shorthand for [`Error::InvalidDsl`].
    pub fn invalid_dsl(message: impl Into<String>) -> Self {
        Error::InvalidDsl {
            message: message.into(),
        }
    }

    /// True for errors that must stop the process from starting.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            Error::InvalidIdentifier { .. }
                | Error::DuplicateMapping { .. }
                | Error::InvalidDeclaration { .. }
        )
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            Error::DuplicateMapping { .. } => "DUPLICATE_MAPPING",
            Error::InvalidDeclaration { .. } => "INVALID_DECLARATION",
            Error::MissingContext(_) => "MISSING_CONTEXT",
            Error::UnregisteredField { .. } => "UNREGISTERED_FIELD",
            Error::UnauthorizedColumnReference { .. } => "UNAUTHORIZED_COLUMN_REFERENCE",
            Error::CrossResourceReference { .. } => "CROSS_RESOURCE_REFERENCE",
            Error::DecisionSourceFailure { .. } => "DECISION_SOURCE_FAILURE",
            Error::InvalidRule { .. } => "INVALID_RULE",
            Error::InvalidDsl { .. } => "INVALID_DSL",
            Error::UnsupportedExpression { .. } => "UNSUPPORTED_EXPRESSION",
            Error::SqlParse(_) => "SQL_PARSE_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }
}
