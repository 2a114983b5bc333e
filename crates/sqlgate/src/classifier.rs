//! Lexical statement classification.
//!
//! Every statement handed to this module has already been normalised and
//! upper-cased by [`crate::sql::split_statements`]. A statement is allowed
//! only when its leading clause is one of `SELECT`, `INSERT INTO`,
//! `UPDATE <table> ... SET` or `DELETE FROM`; anything else is forbidden.

use std::{collections::BTreeSet, fmt, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

static SELECT_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SELECT\b").expect("select pattern"));

static INSERT_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^INSERT\s+INTO\b").expect("insert pattern"));

static UPDATE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^UPDATE\s+\S+\s.*?\bSET\b").expect("update pattern"));

static DELETE_CLAUSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^DELETE\s+FROM\b").expect("delete pattern"));

// The `(?:^|;)` anchors let the same patterns run over a whole normalised
// submission as well as over a single statement.
static INSERT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|;)\s*INSERT\s+INTO\b").expect("insert marker"));

static UPDATE_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|;)\s*UPDATE\s+[^\s;]+\s[^;]*?\bSET\b").expect("update marker")
});

static DELETE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|;)\s*DELETE\s+FROM\b").expect("delete marker"));

static INSERT_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|;)\s*INSERT\s+INTO\s+([^\s(;]+)").expect("insert table"));

static UPDATE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|;)\s*UPDATE\s+([^\s;]+)").expect("update table"));

static DELETE_TABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|;)\s*DELETE\s+FROM\s+([^\s;]+)").expect("delete table"));

/// Kind of data-modifying statement that requires confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Insert,
    Update,
    Delete,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Insert => "INSERT",
            QueryType::Update => "UPDATE",
            QueryType::Delete => "DELETE",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// At least one statement is outside the allow-list; carries its leading word.
    Forbidden(String),
    /// Every statement is a `SELECT`.
    ReadOnly,
    /// Allowed, but at least one statement writes data.
    Mutating {
        query_type: QueryType,
        tables: BTreeSet<String>,
    },
}

fn is_allowed(statement: &str) -> bool {
    SELECT_CLAUSE.is_match(statement)
        || INSERT_CLAUSE.is_match(statement)
        || UPDATE_CLAUSE.is_match(statement)
        || DELETE_CLAUSE.is_match(statement)
}

/// Returns the leading keyword of the first statement outside the allow-list.
pub fn find_forbidden_operation<S: AsRef<str>>(statements: &[S]) -> Option<String> {
    statements
        .iter()
        .map(|statement| statement.as_ref().trim())
        .filter(|statement| !statement.is_empty())
        .find(|statement| !is_allowed(statement))
        .map(|statement| {
            statement
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string()
        })
}

/// True when any non-empty statement is not a `SELECT`.
pub fn is_mutating<S: AsRef<str>>(statements: &[S]) -> bool {
    statements
        .iter()
        .map(|statement| statement.as_ref().trim())
        .any(|statement| !statement.is_empty() && !SELECT_CLAUSE.is_match(statement))
}

/// Picks the query type by marker priority `INSERT INTO` > `UPDATE .. SET` >
/// `DELETE FROM`, defaulting to `UPDATE` when no marker is present.
pub fn classify_query_type(normalized_upper: &str) -> QueryType {
    if INSERT_MARKER.is_match(normalized_upper) {
        QueryType::Insert
    } else if UPDATE_MARKER.is_match(normalized_upper) {
        QueryType::Update
    } else if DELETE_MARKER.is_match(normalized_upper) {
        QueryType::Delete
    } else {
        QueryType::Update
    }
}

/// Collects the lower-cased target table of every `INSERT INTO`, `UPDATE`
/// and `DELETE FROM` clause. Quote characters are dropped and schema
/// qualification is reduced to the trailing name.
pub fn extract_table_names(normalized_upper: &str) -> BTreeSet<String> {
    [&*INSERT_TABLE, &*UPDATE_TABLE, &*DELETE_TABLE]
        .into_iter()
        .flat_map(|pattern| pattern.captures_iter(normalized_upper))
        .filter_map(|captures| captures.get(1))
        .filter_map(|identifier| clean_identifier(identifier.as_str()))
        .collect()
}

fn clean_identifier(raw: &str) -> Option<String> {
    let unquoted: String = raw
        .chars()
        .filter(|c| !matches!(c, '`' | '"' | '[' | ']'))
        .collect();
    let name = unquoted.rsplit('.').next().unwrap_or_default().trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_lowercase())
    }
}

/// Runs the full decision over already split statements.
pub fn classify<S: AsRef<str>>(statements: &[S]) -> Classification {
    if let Some(keyword) = find_forbidden_operation(statements) {
        return Classification::Forbidden(keyword);
    }

    if !is_mutating(statements) {
        return Classification::ReadOnly;
    }

    let joined = statements
        .iter()
        .map(|statement| statement.as_ref())
        .collect::<Vec<_>>()
        .join("; ");

    Classification::Mutating {
        query_type: classify_query_type(&joined),
        tables: extract_table_names(&joined),
    }
}
