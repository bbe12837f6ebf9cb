//! SQL identifier validation, quoting and naming helpers.

use regex::Regex;
use std::sync::OnceLock;

/// Compiled once; table and column names must match it.
fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| {
            // The pattern is a literal; failing to compile it is a build defect.
            unreachable!("identifier pattern must compile: {e}")
        })
    })
}

/// Check whether a table or column name is a plain SQL identifier.
///
/// # Examples
///
/// ```
/// use entmap_core::is_valid_identifier;
///
/// assert!(is_valid_identifier("order_items"));
/// assert!(!is_valid_identifier("order items"));
/// assert!(!is_valid_identifier("1st"));
/// ```
pub fn is_valid_identifier(name: &str) -> bool {
    identifier_pattern().is_match(name)
}

/// Quote a SQL identifier using ANSI double-quoting.
///
/// Embedded double-quotes are escaped by doubling them.
///
/// ```
/// use entmap_core::quote_ident;
///
/// assert_eq!(quote_ident("users"), "\"users\"");
/// assert_eq!(quote_ident("user\"name"), "\"user\"\"name\"");
/// ```
#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert a CamelCase entity name into a snake_case table-style name.
///
/// ```
/// use entmap_core::to_snake_case;
///
/// assert_eq!(to_snake_case("OrderLine"), "order_line");
/// assert_eq!(to_snake_case("order"), "order");
/// ```
pub fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_injection_attempts() {
        assert!(!is_valid_identifier("users; DROP TABLE users"));
        assert!(!is_valid_identifier("\"quoted\""));
        assert!(!is_valid_identifier(""));
        assert!(is_valid_identifier("_private"));
    }

    #[test]
    fn snake_case_handles_single_words() {
        assert_eq!(to_snake_case("Customer"), "customer");
        assert_eq!(to_snake_case("EntityWithVersion"), "entity_with_version");
    }
}
