//! Compile tenant/subject data-access policies into SQL row filters and inject them into host statements.
#![warn(missing_docs)]

/// Decision-to-filter bridge called once per governed table reference.
pub mod bridge;
/// Bounded, versioned, single-flight cache of compiled predicates.
pub mod cache;
/// JSON configuration for the registry, options and change detection.
pub mod config;
/// Thread-confined execution context and its scope guard.
pub mod context;
/// Authorization decisions, access contexts and the decision-source seam.
pub mod decision;
/// Error type shared by every module.
pub mod error;
/// Policy change events, detection and listener plumbing.
pub mod events;
/// SQL statement rewriting.
pub mod interceptor;
/// SQL parsing, identifier normalization and expression helpers.
pub mod parser;
/// Range expressions, the JSON range DSL and filter lowering.
pub mod range;
/// Resource registry: statement/table bindings and field whitelists.
pub mod registry;
/// Declarative rule sets and their compiler.
pub mod rules;

pub use error::{Error, Result};
