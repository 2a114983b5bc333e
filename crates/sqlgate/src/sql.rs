//! Statement normalisation and splitting.
//!
//! The gate works on the lexical shape of SQL text, not on a parsed AST. This
//! module turns a raw submission into the list of upper-cased statements the
//! classifier looks at. String literals are not tracked: a `;`, `--` or `/*`
//! inside quotes is treated like real syntax.

use std::sync::LazyLock;

use regex::Regex;

// Line and block comments in one alternation so the leftmost opener wins,
// the same way the database tokenizer resolves `/* -- */` and `-- /*`.
static COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)--[^\n]*|/\*.*?\*/").expect("comment pattern"));

// A statement-looking line that directly follows a line not closed with `;`.
static BARE_NEWLINE_SEPARATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s;])\r?\n([A-Z])").expect("newline separator pattern"));

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// Strips comments, inserts `;` between newline separated statements and
/// collapses whitespace. Casing is left untouched.
pub fn normalize(raw: &str) -> String {
    let without_comments = COMMENT.replace_all(raw, "");
    let separated = BARE_NEWLINE_SEPARATOR.replace_all(&without_comments, "${1};\n${2}");
    WHITESPACE_RUN
        .replace_all(&separated, " ")
        .trim()
        .to_string()
}

/// Splits a submission into trimmed, non-empty, upper-cased statements in
/// submission order.
pub fn split_statements(raw: &str) -> Vec<String> {
    normalize(raw)
        .to_uppercase()
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(str::to_owned)
        .collect()
}
