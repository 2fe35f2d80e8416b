//! CLI entry point for `rowscope`.

use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use rowscope::bridge::DataScopeBridge;
use rowscope::cache::PredicateCacheService;
use rowscope::config::RowscopeConfig;
use rowscope::decision::{AccessContext, SubjectType};
use rowscope::interceptor::StatementInterceptor;
use rowscope::parser::sql_parser::SqlDialect;
use rowscope::registry::ResourceRegistryBuilder;
use rowscope::rules::{InMemoryRuleStore, RuleStoreDecisionSource};
use serde_json::Value as Json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "rowscope",
    about = "Rewrite SQL statements with tenant/subject data-scope filters"
)]
struct Cli {
    /// SQL file to rewrite; reads stdin when omitted
    input: Option<PathBuf>,

    /// Registry and option configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Rule store contents (JSON)
    #[arg(long)]
    rules: PathBuf,

    /// Tenant of the caller
    #[arg(long)]
    tenant: String,

    /// Subject of the caller
    #[arg(long)]
    subject: String,

    /// Kind of subject
    #[arg(long, value_enum, default_value = "user")]
    subject_type: SubjectType,

    /// Host statement identifier
    #[arg(long)]
    statement_id: Option<String>,

    /// Attribute available to rule placeholders, as KEY=VALUE (VALUE may be JSON)
    #[arg(long = "attr", value_parser = parse_attribute)]
    attributes: Vec<(String, Json)>,

    /// Append nothing instead of `1 = 0` when policy evaluation fails
    #[arg(long)]
    fail_open: bool,

    /// Also filter DELETE statements
    #[arg(long)]
    apply_to_write: bool,

    /// Override the configured SQL dialect
    #[arg(long, value_enum)]
    dialect: Option<SqlDialect>,

    /// Print collected column constraints and debug logs
    #[arg(long)]
    verbose: bool,
}

fn parse_attribute(raw: &str) -> Result<(String, Json), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("attribute key is empty in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Json::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "rowscope=debug"
    } else {
        "rowscope=warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = match RowscopeConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config {}: {e}", cli.config.display());
            process::exit(2);
        }
    };
    if cli.fail_open {
        config.permission.fail_closed = false;
    }
    if cli.apply_to_write {
        config.permission.apply_to_write = true;
    }
    if let Some(dialect) = cli.dialect {
        config.permission.dialect = dialect;
    }

    // Startup: registry and rule store must be valid before any statement runs.
    let registry = match ResourceRegistryBuilder::from_config(&config.registry) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Invalid registry: {e}");
            process::exit(2);
        }
    };
    let store = match InMemoryRuleStore::load_file(&cli.rules) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Error loading rules {}: {e}", cli.rules.display());
            process::exit(2);
        }
    };

    let source = Arc::new(RuleStoreDecisionSource::new(store, Arc::clone(&registry)));
    let cache = Arc::new(
        PredicateCacheService::new(source, Arc::clone(&registry)).with_options(&config.cache),
    );
    let bridge = Arc::new(DataScopeBridge::new(
        Arc::clone(&registry),
        cache,
        config.permission.clone(),
    ));
    let interceptor = StatementInterceptor::new(bridge, registry);

    let sql = match read_input(cli.input.as_ref()) {
        Ok(sql) => sql,
        Err(e) => {
            eprintln!("Error reading input: {e}");
            process::exit(2);
        }
    };

    let mut access = AccessContext::new(cli.tenant, cli.subject);
    access.subject_type = cli.subject_type;
    for (key, value) in cli.attributes {
        access = access.with_attribute(key, value);
    }

    let rewritten =
        match interceptor.rewrite_with_constraints(&sql, cli.statement_id.as_deref(), &access) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                eprintln!("Rewrite failed [{}]: {e}", e.code());
                process::exit(2);
            }
        };

    println!("{}", rewritten.sql);

    if cli.verbose {
        for (resource, constraint) in &rewritten.constraints {
            eprintln!(
                "Columns of '{resource}': allow {:?}, deny {:?}",
                constraint.allow_columns(),
                constraint.deny_columns()
            );
        }
    }
}

fn read_input(path: Option<&PathBuf>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None => {
            let mut sql = String::new();
            std::io::stdin().read_to_string(&mut sql)?;
            Ok(sql)
        }
    }
}
