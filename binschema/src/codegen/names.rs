//! Schema-name → Rust-identifier mapping for emitted code.

/// Keywords that cannot be used as emitted field identifiers.
const KEYWORDS: &[&str] = &[
    "as", "async", "await", "box", "break", "const", "continue", "crate", "dyn", "else", "enum",
    "extern", "false", "fn", "for", "if", "impl", "in", "let", "loop", "match", "mod", "move",
    "mut", "pub", "ref", "return", "self", "static", "struct", "super", "trait", "true", "type",
    "union", "unsafe", "use", "where", "while", "yield",
];

/// Converts a schema type name (`local_file`) to a Rust type name
/// (`LocalFile`).
pub fn type_name(schema_name: &str) -> String {
    let mut out = String::with_capacity(schema_name.len());
    let mut upper_next = true;
    for ch in schema_name.chars() {
        if ch == '_' || ch == '-' {
            upper_next = true;
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Converts a schema field name to an emitted field identifier, escaping
/// keywords with a trailing underscore.
pub fn field_ident(schema_name: &str) -> String {
    let sanitized: String = schema_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    if KEYWORDS.contains(&sanitized.as_str()) {
        format!("{sanitized}_")
    } else {
        sanitized
    }
}

/// Position-map / type-index key for an array and a variant type, shared by
/// the pre-pass and the selector lookups.
pub fn tracking_key(array_field: &str, type_name: &str) -> String {
    format!("{array_field}__{type_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pascal_case_conversion() {
        assert_eq!(type_name("local_file"), "LocalFile");
        assert_eq!(type_name("eocd"), "Eocd");
        assert_eq!(type_name("central_dir_entry"), "CentralDirEntry");
    }

    #[test]
    fn keyword_fields_get_a_suffix() {
        assert_eq!(field_ident("type"), "type_");
        assert_eq!(field_ident("match"), "match_");
        assert_eq!(field_ident("body"), "body");
    }

    #[test]
    fn tracking_keys() {
        assert_eq!(
            tracking_key("sections", "local_file"),
            "sections__local_file"
        );
    }
}
