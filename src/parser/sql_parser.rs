use serde::{Deserialize, Serialize};
use sqlparser::ast::{Expr, Statement, TableFactor};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::parser::Parser;

use crate::error::Result;

/// SQL dialect used when parsing host statements and conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum SqlDialect {
    /// Dialect-neutral parsing.
    #[default]
    Generic,
    /// `PostgreSQL`.
    Postgres,
    /// `MySQL`.
    Mysql,
}

impl SqlDialect {
    fn dialect(self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
            SqlDialect::Mysql => Box::new(MySqlDialect {}),
        }
    }
}

/// Parse one or more SQL statements.
pub fn parse_statements(sql: &str, dialect: SqlDialect) -> Result<Vec<Statement>> {
    Ok(Parser::parse_sql(dialect.dialect().as_ref(), sql)?)
}

/// Parse a standalone boolean condition with the generic dialect.
pub fn parse_condition(sql: &str) -> Result<Expr> {
    parse_condition_with(sql, SqlDialect::Generic)
}

/// Parse a standalone boolean condition.
pub fn parse_condition_with(sql: &str, dialect: SqlDialect) -> Result<Expr> {
    let dialect = dialect.dialect();
    Ok(Parser::new(dialect.as_ref())
        .try_with_sql(sql)?
        .parse_expr()?)
}

/// Parse a single `FROM` item, such as a derived table.
pub fn parse_table_factor(sql: &str, dialect: SqlDialect) -> Result<TableFactor> {
    let dialect = dialect.dialect();
    Ok(Parser::new(dialect.as_ref())
        .try_with_sql(sql)?
        .parse_table_factor()?)
}
