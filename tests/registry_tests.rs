mod support;

use std::sync::Arc;

use rowscope::config::{ConventionConfig, FieldConfig, RegistryConfig, ResourceConfig};
use rowscope::registry::{
    ColumnNameValidator, ConventionFallbackRegistry, PrefixConvention, ResourceRegistry,
    ResourceRegistryBuilder,
};
use rowscope::Error;

use support::{sample_registry, ORDER_PAGE};

#[test]
fn statement_mapping_wins_over_table_mapping() {
    let registry = sample_registry();
    assert_eq!(
        registry
            .resolve_resource(Some("t_user"), Some(ORDER_PAGE))
            .as_deref(),
        Some("ORDER")
    );
    assert_eq!(
        registry
            .resolve_resource(Some("t_user"), Some("com.x.UserMapper.select"))
            .as_deref(),
        Some("USER")
    );
}

#[test]
fn table_lookup_ignores_case_schema_and_quotes() {
    let registry = sample_registry();
    for table in ["T_ORDER", "public.t_order", "\"T_Order\"", "  t_order  "] {
        assert_eq!(
            registry.resolve_resource(Some(table), None).as_deref(),
            Some("ORDER"),
            "{table}"
        );
    }
}

#[test]
fn unknown_or_missing_inputs_are_not_governed() {
    let registry = sample_registry();
    assert_eq!(registry.resolve_resource(Some("t_audit"), None), None);
    assert_eq!(registry.resolve_resource(None, None), None);
    assert_eq!(registry.resolve_resource(Some("   "), Some("  ")), None);
}

#[test]
fn field_lookup_returns_the_declared_column() {
    let registry = sample_registry();
    let column = registry.resolve_column("ORDER", "deptId").unwrap();
    assert_eq!(column.table(), Some("t_order"));
    assert_eq!(column.column(), "dept_id");
    assert_eq!(column.to_string(), "t_order.dept_id");

    let bare = registry.resolve_column("USER", "deptId").unwrap();
    assert_eq!(bare.table(), None);
    assert_eq!(bare.to_string(), "dept_id");
}

#[test]
fn undeclared_fields_are_rejected() {
    let err = sample_registry()
        .resolve_column("ORDER", "secret")
        .unwrap_err();
    assert!(
        matches!(&err, Error::UnregisteredField { resource, field_key }
            if resource == "ORDER" && field_key == "secret"),
        "{err:?}"
    );
}

#[test]
fn filter_context_lists_tables_and_whitelisted_columns() {
    let context = sample_registry().filter_context("ORDER");
    assert!(context.owns_table("T_ORDER"));
    assert!(context.allows_column("DEPT_ID"));
    assert!(!context.allows_column("secret_col"));

    let unknown = sample_registry().filter_context("NOPE");
    assert!(unknown.tables().is_empty());
    assert!(!unknown.allows_column("id"));
}

#[test]
fn conflicting_table_mappings_fail_the_build() {
    let err = ResourceRegistryBuilder::new()
        .map_table("t_order", "ORDER")
        .map_table("T_ORDER", "SALES")
        .build()
        .unwrap_err();
    assert!(
        matches!(&err, Error::DuplicateMapping { kind: "table", previous, current, .. }
            if previous == "ORDER" && current == "SALES"),
        "{err:?}"
    );
    assert!(err.is_startup());
}

#[test]
fn identical_redeclarations_are_accepted() {
    let registry = ResourceRegistryBuilder::new()
        .map_statement(ORDER_PAGE, "ORDER")
        .map_statement(ORDER_PAGE, "ORDER")
        .map_field("ORDER", "deptId", Some("t_order".to_string()), "dept_id")
        .map_field("ORDER", "deptId", Some("t_order".to_string()), "dept_id")
        .build()
        .unwrap();
    assert_eq!(registry.resources(), vec!["ORDER"]);
}

#[test]
fn conflicting_field_mappings_fail_the_build() {
    let err = ResourceRegistryBuilder::new()
        .map_field("ORDER", "deptId", None, "dept_id")
        .map_field("ORDER", "deptId", Some("t_order".to_string()), "department_id")
        .build()
        .unwrap_err();
    assert!(
        matches!(&err, Error::DuplicateMapping { kind: "field", previous, current, .. }
            if previous == "dept_id" && current == "t_order.department_id"),
        "{err:?}"
    );
}

#[test]
fn injection_shaped_identifiers_fail_the_build() {
    for column in [
        "dept_id; DROP TABLE t_order",
        "dept_id OR 1=1",
        "a.b",
        "\"quoted\"",
        "1col",
        "",
    ] {
        let result = ResourceRegistryBuilder::new()
            .map_field("ORDER", "deptId", None, column)
            .build();
        assert!(result.is_err(), "{column:?} should be rejected");
    }

    let err = ResourceRegistryBuilder::new()
        .map_table("t_order --", "ORDER")
        .build()
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_IDENTIFIER");
}

#[test]
fn length_cap_is_configurable() {
    let long = "c".repeat(20);
    assert!(ResourceRegistryBuilder::new()
        .validator(ColumnNameValidator::new(16))
        .map_field("ORDER", "f", None, long.clone())
        .build()
        .is_err());
    assert!(ResourceRegistryBuilder::new()
        .map_field("ORDER", "f", None, long)
        .build()
        .is_ok());
}

#[test]
fn convention_applies_only_after_explicit_mappings() {
    let explicit = ResourceRegistryBuilder::new()
        .map_table("t_order", "SALES_ORDER")
        .build()
        .unwrap();
    let registry = ConventionFallbackRegistry::new(explicit, PrefixConvention::default());

    assert_eq!(
        registry.resolve_resource(Some("t_order"), None).as_deref(),
        Some("SALES_ORDER")
    );
    assert_eq!(
        registry.resolve_resource(Some("t_invoice"), None).as_deref(),
        Some("INVOICE")
    );
    assert_eq!(registry.resolve_resource(Some("bad-name"), None), None);
    assert!(registry.resolve_column("INVOICE", "id").is_err());
}

#[test]
fn config_builds_a_registry_with_optional_convention() {
    let mut fields = std::collections::BTreeMap::new();
    fields.insert(
        "deptId".to_string(),
        FieldConfig {
            table: Some("t_order".to_string()),
            column: "dept_id".to_string(),
        },
    );
    let mut config = RegistryConfig {
        convention: None,
        resources: vec![ResourceConfig {
            name: "ORDER".to_string(),
            tables: vec!["t_order".to_string()],
            statements: vec![ORDER_PAGE.to_string()],
            fields,
        }],
    };

    let plain: Arc<dyn ResourceRegistry> = ResourceRegistryBuilder::from_config(&config).unwrap();
    assert_eq!(plain.resolve_resource(Some("t_invoice"), None), None);
    assert_eq!(
        plain.resolve_column("ORDER", "deptId").unwrap().column(),
        "dept_id"
    );

    config.convention = Some(ConventionConfig {
        enabled: true,
        prefixes: vec!["tbl_".to_string()],
    });
    let conventional = ResourceRegistryBuilder::from_config(&config).unwrap();
    assert_eq!(
        conventional
            .resolve_resource(Some("tbl_invoice"), None)
            .as_deref(),
        Some("INVOICE")
    );
}
