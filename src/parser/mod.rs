/// SQL expression helpers: column walking, connectives, literals.
pub mod expr;
/// Identifier and table-name normalization helpers (schema-qualified names, quoted identifiers).
pub mod names;
/// Thin wrapper around `sqlparser` for statements and conditions.
pub mod sql_parser;
