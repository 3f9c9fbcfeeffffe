//! Identifier and literal quoting.

const RESERVED: &[&str] = &[
    "all", "and", "as", "asc", "between", "by", "case", "cast", "create", "default", "delete",
    "desc", "distinct", "drop", "else", "end", "false", "from", "full", "group", "having", "in",
    "inner", "insert", "interval", "into", "is", "join", "left", "like", "limit", "not", "null",
    "offset", "on", "or", "order", "outer", "over", "partition", "right", "select", "table",
    "then", "true", "union", "update", "user", "using", "when", "where", "window", "with",
];

fn is_simple(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name.to_ascii_lowercase().as_str())
}

/// Render a column name as a SQL identifier.
///
/// Simple names stay bare; everything else is double-quoted with embedded
/// quotes doubled.
pub fn quote_ident(name: &str) -> String {
    if is_simple(name) {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// Strip one level of surrounding double quotes, if present.
pub fn unquote_ident(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].replace("\"\"", "\"")
    } else {
        trimmed.to_string()
    }
}

/// Render a string as a single-quoted SQL literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Build a column name from descriptive parts, e.g.
/// `["skewness", "x", "by", "g"]` becomes `skewness_x_by_g`.
pub fn generated_name<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .map(|part| {
            part.as_ref()
                .to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_")
}
