//! Database name derivation and identifier handling.
//!
//! All managed databases live under a shared prefix:
//! templates as `<prefix>_<template_prefix>_<hash>` and test instances as
//! `<prefix>_<test_prefix>_<hash>_<NNNN>` with a zero-padded ordinal.

/// Whether `value` is usable as a name component: non-empty and limited to
/// `[A-Za-z0-9_]`. Anything else never reaches SQL.
pub fn is_safe_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Quote a name per Postgres identifier rules: wrap in double quotes and
/// double any embedded quote.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// The name of the template database for `hash`.
pub fn template_database_name(prefix: &str, template_prefix: &str, hash: &str) -> String {
    format!("{prefix}_{template_prefix}_{hash}")
}

/// The shared name prefix of every template database (trailing separator
/// included), for catalog listing.
pub fn managed_template_prefix(prefix: &str, template_prefix: &str) -> String {
    format!("{prefix}_{template_prefix}_")
}

/// The name prefix of test databases for `hash` (trailing separator
/// included); append the padded ordinal to obtain a full name.
pub fn test_database_prefix(prefix: &str, test_prefix: &str, hash: &str) -> String {
    format!("{prefix}_{test_prefix}_{hash}_")
}

/// The shared name prefix of every test database, for catalog listing.
pub fn managed_test_prefix(prefix: &str, test_prefix: &str) -> String {
    format!("{prefix}_{test_prefix}_")
}

/// The name of test database `id` for `hash`. The ordinal is zero-padded
/// to four digits; larger ids widen the field without truncation.
pub fn test_database_name(prefix: &str, test_prefix: &str, hash: &str, id: usize) -> String {
    format!("{prefix}_{test_prefix}_{hash}_{id:04}")
}

/// Recover `(hash, id)` from a managed test database name.
///
/// Returns `None` for names outside this coordinator's namespace.
pub fn parse_test_database_name(
    name: &str,
    prefix: &str,
    test_prefix: &str,
) -> Option<(String, usize)> {
    let rest = name.strip_prefix(&managed_test_prefix(prefix, test_prefix))?;
    let (hash, id) = rest.rsplit_once('_')?;
    if hash.is_empty() || !is_safe_identifier(hash) {
        return None;
    }
    let id = id.parse::<usize>().ok()?;
    Some((hash.to_string(), id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_identifier_alphabet() {
        assert!(is_safe_identifier("abc_123"));
        assert!(is_safe_identifier("ABC"));
        assert!(!is_safe_identifier(""));
        assert!(!is_safe_identifier("a-b"));
        assert!(!is_safe_identifier("a b"));
        assert!(!is_safe_identifier("a;DROP"));
        assert!(!is_safe_identifier("héllo"));
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(quote_identifier("plain"), "\"plain\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn template_name_layout() {
        assert_eq!(
            template_database_name("tp", "template", "abc"),
            "tp_template_abc"
        );
    }

    #[test]
    fn test_name_is_zero_padded() {
        assert_eq!(test_database_name("tp", "test", "abc", 0), "tp_test_abc_0000");
        assert_eq!(test_database_name("tp", "test", "abc", 42), "tp_test_abc_0042");
        assert_eq!(
            test_database_name("tp", "test", "abc", 12345),
            "tp_test_abc_12345"
        );
    }

    #[test]
    fn parse_round_trips() {
        let name = test_database_name("tp", "test", "abc", 7);
        assert_eq!(
            parse_test_database_name(&name, "tp", "test"),
            Some(("abc".to_string(), 7))
        );
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert_eq!(parse_test_database_name("tp_other", "tp", "test"), None);
        assert_eq!(
            parse_test_database_name("tp_template_abc", "tp", "test"),
            None
        );
        assert_eq!(
            parse_test_database_name("tp_test_abc_xyz", "tp", "test"),
            None
        );
    }
}
