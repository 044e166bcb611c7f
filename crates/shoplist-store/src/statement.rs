//! Structured select statements.
//!
//! A list request becomes a pair of statements sharing one predicate set:
//! `fetch` returns the requested window of rows, `count` returns the size of
//! the unwindowed result. Engines render statements to their own query
//! language; user-supplied text only ever travels as a bound parameter.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::StoreError;
use crate::query::{BoughtFilter, PaginationQuery, SortOrder};

/// Name of the parameter carrying the full-text search text.
pub const SEARCH_PARAM: &str = "search";

/// What a statement returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Projection {
    /// Documents with their key joined in as `id`.
    Rows,
    /// A single `{"total": n}` row.
    Count,
}

/// Predicate appended to the always-true base filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    BoughtEquals(bool),
    /// Full-text match against the named parameter.
    Search { param: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    /// The storage key of the document.
    DocumentKey,
    /// A top-level document field, passed through by name.
    Field(String),
    /// How well the document matched the search condition.
    Relevance,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderKey {
    pub key: SortKey,
    pub order: SortOrder,
}

impl OrderKey {
    pub fn field(name: impl Into<String>, order: SortOrder) -> Self {
        Self {
            key: SortKey::Field(name.into()),
            order,
        }
    }

    pub fn document_key() -> Self {
        Self {
            key: SortKey::DocumentKey,
            order: SortOrder::Asc,
        }
    }

    /// Best matches first.
    pub fn relevance() -> Self {
        Self {
            key: SortKey::Relevance,
            order: SortOrder::Desc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub projection: Projection,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<OrderKey>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub params: BTreeMap<String, Value>,
}

impl SelectStatement {
    pub fn rows() -> Self {
        Self {
            projection: Projection::Rows,
            conditions: Vec::new(),
            order_by: Vec::new(),
            offset: None,
            limit: None,
            params: BTreeMap::new(),
        }
    }

    pub fn count() -> Self {
        Self {
            projection: Projection::Count,
            ..Self::rows()
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn order(mut self, key: OrderKey) -> Self {
        self.order_by.push(key);
        self
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Copy of this statement's predicates and parameters as a count.
    pub fn to_count(&self) -> Self {
        Self {
            projection: Projection::Count,
            conditions: self.conditions.clone(),
            order_by: Vec::new(),
            offset: None,
            limit: None,
            params: self.params.clone(),
        }
    }
}

/// Fetch and count statements over the same predicates.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementPair {
    pub fetch: SelectStatement,
    pub count: SelectStatement,
}

/// Translate a view filter and list request into a statement pair.
pub fn build_statements(
    filter: BoughtFilter,
    q: &PaginationQuery,
) -> Result<StatementPair, StoreError> {
    if q.end != 0 && q.end < q.start {
        return Err(StoreError::InvalidQuery {
            op: "get_items",
            message: format!("window end {} is before start {}", q.end, q.start),
        });
    }

    let mut base = SelectStatement::rows();
    if let Some(bought) = filter.bound_value() {
        base = base.filter(Condition::BoughtEquals(bought));
    }
    if let Some(text) = q.search_text() {
        base = base
            .filter(Condition::Search {
                param: SEARCH_PARAM.to_string(),
            })
            .bind(SEARCH_PARAM, text);
    }

    let count = base.to_count();

    let mut fetch = base;
    if q.bought_last {
        fetch = fetch.order(OrderKey::field("bought", SortOrder::Asc));
    }
    match q.sort_field() {
        Some(field) => fetch = fetch.order(OrderKey::field(field, q.order)),
        None if q.search_text().is_some() => fetch = fetch.order(OrderKey::relevance()),
        None => {}
    }
    // Key order as the last tiebreaker keeps pages stable.
    fetch = fetch.order(OrderKey::document_key());

    if q.start != 0 {
        fetch.offset = Some(q.start);
    }
    if q.end != 0 {
        fetch.limit = Some(q.end - q.start);
    }

    Ok(StatementPair { fetch, count })
}
