//! Full-text search over entries.
//!
//! A bare term is whitespace-split into FTS5 prefix tokens combined with
//! AND; optional filters (kind, stage class, entry-date range) compose as
//! plain SQL predicates. Results paginate with a total and a has-more flag.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::types::{Entry, EntryKind, StageClass};
use super::{StoreError, ENTRY_COLUMNS};

/// Search parameters.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub term: Option<String>,
    pub kind: Option<EntryKind>,
    pub stage_class: Option<StageClass>,
    /// Inclusive `YYYY-MM-DD` lower bound on `entry_date`.
    pub from_date: Option<String>,
    /// Inclusive `YYYY-MM-DD` upper bound on `entry_date`.
    pub to_date: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of search results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub entries: Vec<Entry>,
    pub total: i64,
    pub has_more: bool,
}

/// Build an FTS5 MATCH expression from a bare search term.
///
/// Tokens are quoted (FTS5 operators and punctuation must not leak into the
/// query syntax) and suffixed with `*` for prefix matching. Returns `None`
/// when no usable token remains.
fn fts_expression(term: &str) -> Option<String> {
    let tokens: Vec<String> = term
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\"*"))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" AND "))
    }
}

fn stage_class_predicate(class: StageClass) -> &'static str {
    match class {
        StageClass::Active => "stage NOT IN ('completed', 'failed', 'cancelled')",
        StageClass::Done => "stage = 'completed'",
        StageClass::Failed => "stage IN ('failed', 'cancelled')",
    }
}

pub(crate) fn run(conn: &Connection, query: &SearchQuery) -> Result<SearchPage, StoreError> {
    let mut predicates: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    let match_expr = query.term.as_deref().and_then(fts_expression);
    let from_clause = if match_expr.is_some() {
        predicates.push("entries_fts MATCH ?".to_owned());
        if let Some(expr) = &match_expr {
            values.push(Box::new(expr.clone()));
        }
        "entries e JOIN entries_fts f ON f.entry_id = e.id"
    } else {
        "entries e"
    };

    if let Some(kind) = query.kind {
        predicates.push("e.kind = ?".to_owned());
        values.push(Box::new(kind.as_str()));
    }
    if let Some(class) = query.stage_class {
        predicates.push(format!("e.{}", stage_class_predicate(class)));
    }
    if let Some(from) = &query.from_date {
        predicates.push("e.entry_date >= ?".to_owned());
        values.push(Box::new(from.clone()));
    }
    if let Some(to) = &query.to_date {
        predicates.push("e.entry_date <= ?".to_owned());
        values.push(Box::new(to.clone()));
    }

    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT count(*) FROM {from_clause}{where_clause}"),
        rusqlite::params_from_iter(values.iter().map(|v| &**v)),
        |row| row.get(0),
    )?;

    let sql = format!(
        "SELECT {cols} FROM {from_clause}{where_clause} \
         ORDER BY e.created_at DESC LIMIT ? OFFSET ?",
        cols = entry_columns_qualified(),
    );
    values.push(Box::new(query.limit as i64));
    values.push(Box::new(query.offset as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(values.iter().map(|v| &**v)),
        super::row_to_entry,
    )?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row??);
    }

    let has_more = (query.offset as i64 + entries.len() as i64) < total;
    Ok(SearchPage {
        entries,
        total,
        has_more,
    })
}

/// `ENTRY_COLUMNS` with the `e.` alias prefix for joined queries.
fn entry_columns_qualified() -> String {
    ENTRY_COLUMNS
        .split(',')
        .map(|c| format!("e.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
