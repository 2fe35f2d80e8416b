/// JSON range DSL parser.
pub mod dsl;
/// Range expression AST.
pub mod expression;
/// Whitelist-validating filter builder.
pub mod filter;

pub use dsl::parse_range_dsl;
pub use expression::{LogicalOperator, RangeExpression};
pub use filter::{RangeFilter, RangeFilterBuilder, RangeFilterContext, SqlRangeFilterBuilder};
