use sqlparser::ast::{Ident, ObjectName};

/// Return the identifier without surrounding double quotes or backticks.
pub fn unquote_identifier(ident: &str) -> &str {
    ident
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| ident.strip_prefix('`').and_then(|s| s.strip_suffix('`')))
        .unwrap_or(ident)
}

/// Normalize an identifier for case-insensitive matching.
///
/// Trims whitespace, removes surrounding quotes on a single identifier,
/// and lowercases the result.
pub fn normalize_identifier(ident: &str) -> String {
    unquote_identifier(ident.trim()).to_ascii_lowercase()
}

/// Dot-separated parts of a qualified name, unquoted.
///
/// Dots inside quotes do not split: `"my.schema"."t"` has two parts.
pub fn qualified_name_parts(name: &str) -> Vec<&str> {
    let mut quote: Option<char> = None;
    let mut parts = Vec::new();
    let mut start = 0usize;
    for (idx, ch) in name.char_indices() {
        match (quote, ch) {
            (None, '"' | '`') => quote = Some(ch),
            (Some(open), _) if open == ch => quote = None,
            (None, '.') => {
                parts.push(unquote_identifier(name[start..idx].trim()));
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(unquote_identifier(name[start..].trim()));
    parts
}

/// Lowercased terminal relation of a possibly schema-qualified name.
///
/// `public.t_order` and `"app"."T_Order"` both give `t_order`.
pub fn normalize_relation_name(name: &str) -> String {
    qualified_name_parts(name.trim())
        .last()
        .map(|relation| relation.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Terminal relation of a parsed table name, lowercased.
pub fn object_relation_name(name: &ObjectName) -> String {
    normalize_relation_name(&name.to_string())
}

/// Table qualifier of a compound column reference.
///
/// `t.col` -> `t`, `schema.t.col` -> `t`; a single identifier has none.
pub fn column_qualifier(parts: &[Ident]) -> Option<String> {
    if parts.len() < 2 {
        return None;
    }
    Some(parts[parts.len() - 2].value.to_ascii_lowercase())
}
