//! Apicalypse request bodies for the count and page queries.
use chrono::{DateTime, Utc};

use super::kinds::EntityKind;

fn where_clause(kind: EntityKind, updated_since: Option<DateTime<Utc>>) -> Option<String> {
    let mut filters: Vec<String> = Vec::new();
    if let Some(base) = kind.spec().base_filter {
        filters.push(base.to_string());
    }
    if let Some(since) = updated_since {
        filters.push(format!("updated_at > {}", since.timestamp()));
    }
    if filters.is_empty() {
        None
    } else {
        Some(format!("where {};", filters.join(" & ")))
    }
}

/// Body for `POST /<endpoint>/count`.
pub fn count_query(kind: EntityKind, updated_since: Option<DateTime<Utc>>) -> String {
    where_clause(kind, updated_since).unwrap_or_default()
}

/// Body for `POST /<endpoint>`; sorted by id so offset paging stays stable within a run.
pub fn page_query(
    kind: EntityKind,
    limit: u32,
    offset: u64,
    updated_since: Option<DateTime<Utc>>,
) -> String {
    let mut body = format!("fields {};", kind.spec().fields);
    if let Some(w) = where_clause(kind, updated_since) {
        body.push(' ');
        body.push_str(&w);
    }
    body.push_str(&format!(" sort id asc; limit {limit}; offset {offset};"));
    body
}
