//! Native queries and their query spaces.
//!
//! The session never parses SQL beyond what auto-flush needs: the set of
//! tables a statement reads or writes. Tables named after `FROM`, `JOIN`,
//! `INTO` and `UPDATE` are picked up by a regex, as is every entry of a
//! comma-separated `FROM` list; callers can add spaces the extractor cannot
//! see (views, functions) with [`Query::space`].

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::OnceLock;
use unitwork_core::Value;

/// A SQL statement plus parameters and the tables it touches.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
    spaces: Vec<String>,
}

impl Query {
    /// Create a query from SQL text.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            spaces: Vec::new(),
        }
    }

    /// Append a positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Replace all parameters.
    #[must_use]
    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Declare an additional table this query depends on.
    #[must_use]
    pub fn space(mut self, table: impl Into<String>) -> Self {
        self.spaces.push(table.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameters(&self) -> &[Value] {
        &self.params
    }

    /// Declared spaces plus every table found in the SQL text.
    pub fn query_spaces(&self) -> BTreeSet<String> {
        let mut spaces: BTreeSet<String> = self.spaces.iter().cloned().collect();
        spaces.extend(extract_tables(&self.sql));
        spaces
    }
}

fn table_ref_regex() -> Option<&'static Regex> {
    static TABLE_REF: OnceLock<Option<Regex>> = OnceLock::new();
    TABLE_REF
        .get_or_init(|| {
            match Regex::new(concat!(
                r#"(?i)\b(?:from|join|into|update)\s+"#,
                r#"(?:"([^"]+)"|`([^`]+)`|([A-Za-z_][A-Za-z0-9_.]*))"#,
            )) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to compile table reference pattern");
                    None
                }
            }
        })
        .as_ref()
}

// The list after FROM, up to the next clause or join.
fn from_list_regex() -> Option<&'static Regex> {
    static FROM_LIST: OnceLock<Option<Regex>> = OnceLock::new();
    FROM_LIST
        .get_or_init(|| {
            match Regex::new(concat!(
                r"(?is)\bfrom\s+([^(\s].*?)",
                r"(?:\b(?:where|join|inner|left|right|full|cross|natural|group|order|having",
                r"|limit|offset|union|intersect|except|returning|window|for)\b|[();]|$)",
            )) {
                Ok(re) => Some(re),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to compile FROM list pattern");
                    None
                }
            }
        })
        .as_ref()
}

fn bare_table(name: &str) -> Option<String> {
    let name = name.rsplit('.').next().unwrap_or(name);
    if name.is_empty() || is_keyword(name) {
        return None;
    }
    Some(name.to_ascii_lowercase())
}

/// The table named at the start of one `FROM` list entry, alias ignored.
fn leading_table(item: &str) -> Option<String> {
    let item = item.trim_start();
    for quote in ['"', '`'] {
        if let Some(rest) = item.strip_prefix(quote) {
            return rest.split(quote).next().map(str::to_string);
        }
    }
    if !item.starts_with(|c: char| c.is_ascii_alphabetic() || c == '_') {
        return None;
    }
    let end = item
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(item.len());
    bare_table(&item[..end])
}

/// Table names referenced after `FROM`, `JOIN`, `INTO` or `UPDATE`,
/// including every table of a comma-separated `FROM` list.
///
/// Schema-qualified names keep only the table part; names are lowercased
/// unless they were quoted.
pub fn extract_tables(sql: &str) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    if let Some(re) = table_ref_regex() {
        for caps in re.captures_iter(sql) {
            if let Some(quoted) = caps.get(1).or_else(|| caps.get(2)) {
                tables.insert(quoted.as_str().to_string());
            } else if let Some(name) = caps.get(3).and_then(|bare| bare_table(bare.as_str())) {
                tables.insert(name);
            }
        }
    }
    if let Some(re) = from_list_regex() {
        for caps in re.captures_iter(sql) {
            if let Some(list) = caps.get(1).filter(|l| l.as_str().contains(',')) {
                tables.extend(list.as_str().split(',').filter_map(leading_table));
            }
        }
    }
    tables
}

// `DELETE FROM (SELECT ...)`, `INSERT INTO ... SELECT` and friends.
fn is_keyword(word: &str) -> bool {
    matches!(
        word.to_ascii_lowercase().as_str(),
        "select" | "lateral" | "only" | "set" | "values"
    )
}
