//! Query text helpers: wildcard expansion and cache fingerprints.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic cache key derived from literal query text.
///
/// The key is the lowercase hex encoding of the query bytes, so distinct
/// query texts never share a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(query: &str) -> Self {
        Self(hex::encode(query.as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_boundary(c: Option<char>) -> bool {
    match c {
        None => true,
        Some(c) => c.is_whitespace() || c == ',',
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// What the last significant token of a select list was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListPosition {
    /// After `SELECT`, `SELECT DISTINCT`/`ALL`, or a comma: a column may start
    ItemStart,
    /// Inside an item expression
    InItem,
}

/// Scanner state after a complete top-level word.
fn after_word(word: &str, in_list: bool, position: ListPosition) -> (bool, ListPosition) {
    if word.eq_ignore_ascii_case("select") {
        return (true, ListPosition::ItemStart);
    }
    if !in_list || word.eq_ignore_ascii_case("from") {
        return (false, ListPosition::InItem);
    }
    let modifier = word.eq_ignore_ascii_case("distinct") || word.eq_ignore_ascii_case("all");
    if modifier && position == ListPosition::ItemStart {
        (true, ListPosition::ItemStart)
    } else {
        (true, ListPosition::InItem)
    }
}

/// Replace every `*` selector with the explicit column list.
///
/// A selector is a `*` that starts an item of a top-level select list (right
/// after `SELECT`, `SELECT DISTINCT`, or a comma, before the matching `FROM`),
/// delimited on both sides by whitespace, a comma, or the ends of the text.
/// Multiplication, `COUNT(*)`, `t.*`, `'*'` and subqueries are left alone.
/// Expansion is idempotent.
pub fn expand_wildcard(query: &str, columns: &[&str]) -> String {
    if columns.is_empty() || !query.contains('*') {
        return query.to_string();
    }

    let list = columns.join(", ");
    let chars: Vec<char> = query.chars().collect();
    let mut out = String::with_capacity(query.len() + list.len());
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut word = String::new();
    let mut in_list = false;
    let mut position = ListPosition::InItem;

    for (i, &c) in chars.iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            out.push(c);
            continue;
        }

        if depth == 0 && is_word_char(c) {
            word.push(c);
            out.push(c);
            continue;
        }
        if !word.is_empty() {
            (in_list, position) = after_word(&word, in_list, position);
            word.clear();
        }

        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                position = ListPosition::InItem;
            }
            '(' => {
                depth += 1;
                position = ListPosition::InItem;
            }
            ')' => depth = depth.saturating_sub(1),
            _ if depth > 0 => {}
            ',' => position = ListPosition::ItemStart,
            '*' if in_list
                && position == ListPosition::ItemStart
                && is_boundary(i.checked_sub(1).map(|p| chars[p]))
                && is_boundary(chars.get(i + 1).copied()) =>
            {
                out.push_str(&list);
                position = ListPosition::InItem;
                continue;
            }
            c if c.is_whitespace() => {}
            _ => position = ListPosition::InItem,
        }
        out.push(c);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const COLUMNS: &[&str] = &["name", "created_at"];

    #[test]
    fn test_expand_selector() {
        assert_eq!(
            expand_wildcard("SELECT * FROM model", COLUMNS),
            "SELECT name, created_at FROM model"
        );
    }

    #[test]
    fn test_no_asterisk_is_kept() {
        let q = "SELECT name, created_at FROM model";
        assert_eq!(expand_wildcard(q, COLUMNS), q);
    }

    #[test]
    fn test_non_selector_asterisks_untouched() {
        let q = "SELECT COUNT(*) FROM model WHERE note = '*' AND m.* IS NOT NULL";
        assert_eq!(expand_wildcard(q, COLUMNS), q);
    }

    #[test]
    fn test_multiplication_is_not_a_selector() {
        assert_eq!(
            expand_wildcard("SELECT * FROM orders WHERE price * 2 > 10", &["id", "name"]),
            "SELECT id, name FROM orders WHERE price * 2 > 10"
        );
        let q = "SELECT price * qty FROM orders ORDER BY price * qty";
        assert_eq!(expand_wildcard(q, COLUMNS), q);
    }

    #[test]
    fn test_distinct_and_union_selectors() {
        assert_eq!(
            expand_wildcard("select distinct * from a union all select * from b", &["x"]),
            "select distinct x from a union all select x from b"
        );
    }

    #[test]
    fn test_subquery_selector_untouched() {
        let q = "SELECT id FROM t WHERE EXISTS (SELECT * FROM u)";
        assert_eq!(expand_wildcard(q, COLUMNS), q);
    }

    #[test]
    fn test_selector_next_to_comma() {
        assert_eq!(
            expand_wildcard("SELECT id,* FROM t", &["a"]),
            "SELECT id,a FROM t"
        );
    }

    #[test]
    fn test_fingerprint_is_hex_of_text() {
        assert_eq!(Fingerprint::of("SELECT 1").as_str(), "53454c4543542031");
    }

    proptest! {
        #[test]
        fn prop_expansion_is_idempotent(
            table in "[a-z]{1,12}",
            cols in prop::collection::vec("[a-z_]{1,10}", 1..6),
            factor in 1u32..1000,
        ) {
            let refs: Vec<&str> = cols.iter().map(String::as_str).collect();
            let tail = format!("WHERE price * {factor} > 10 ORDER BY price * 2");
            let query = format!("SELECT * FROM {table} {tail}");
            let once = expand_wildcard(&query, &refs);
            prop_assert_eq!(&once, &format!("SELECT {} FROM {table} {tail}", refs.join(", ")));
            prop_assert_eq!(expand_wildcard(&once, &refs), once);
        }

        #[test]
        fn prop_fingerprint_deterministic_and_distinct(a in ".{0,64}", b in ".{0,64}") {
            prop_assert_eq!(Fingerprint::of(&a), Fingerprint::of(&a));
            if a != b {
                prop_assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
            }
        }
    }
}
