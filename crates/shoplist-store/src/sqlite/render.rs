use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::cluster::BackendError;
use crate::query::SortOrder;
use crate::statement::{Condition, OrderKey, Projection, SelectStatement, SortKey};

/// Compiled SQL with positional parameters.
#[derive(Debug)]
pub(crate) struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Alias of the collection table in every compiled statement.
const TABLE_ALIAS: &str = "t";
/// Alias of the ranked search matches joined in for a search condition.
const MATCH_ALIAS: &str = "s";

/// Translate a select statement into SQL over a collection table.
///
/// `table` and `fts_table` must already be quoted identifiers. The first
/// search condition joins its matches with their `bm25` score so results can
/// be ranked; any further search conditions only filter.
pub(crate) fn compile_select(
    stmt: &SelectStatement,
    table: &str,
    fts_table: &str,
) -> Result<CompiledQuery, BackendError> {
    let mut join_params = Vec::new();
    let mut params = Vec::new();

    let projection = match stmt.projection {
        Projection::Rows => format!("{t}.key, {t}.doc", t = TABLE_ALIAS),
        Projection::Count => "COUNT(*)".to_string(),
    };

    let mut from = format!("{} AS {}", table, TABLE_ALIAS);
    let mut ranked = false;

    // WHERE
    let mut conditions = vec!["1".to_string()];
    for condition in &stmt.conditions {
        match condition {
            Condition::BoughtEquals(bought) => {
                let expr = field_expr("bought", &mut params);
                params.push(SqlValue::Integer(i64::from(*bought)));
                conditions.push(format!("{} = ?", expr));
            }
            Condition::Search { param } => {
                let terms = fts_query(search_text(stmt, param)?);
                if terms.is_empty() {
                    // Nothing searchable left, so nothing can match.
                    conditions.push("0".to_string());
                } else if !ranked {
                    ranked = true;
                    join_params.push(SqlValue::Text(terms));
                    from.push_str(&format!(
                        " JOIN (SELECT key, bm25({f}) AS score FROM {f} WHERE {f} MATCH ?) AS {s} \
                         ON {s}.key = {t}.key",
                        f = fts_table,
                        s = MATCH_ALIAS,
                        t = TABLE_ALIAS
                    ));
                } else {
                    params.push(SqlValue::Text(terms));
                    conditions.push(format!(
                        "{t}.key IN (SELECT key FROM {f} WHERE {f} MATCH ?)",
                        f = fts_table,
                        t = TABLE_ALIAS
                    ));
                }
            }
        }
    }

    let mut sql = format!(
        "SELECT {} FROM {} WHERE {}",
        projection,
        from,
        conditions.join(" AND ")
    );

    // ORDER BY
    let keys: Vec<String> = stmt
        .order_by
        .iter()
        .filter_map(|k| compile_order_key(k, ranked, &mut params))
        .collect();
    if !keys.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }

    // LIMIT / OFFSET; SQLite needs a LIMIT before any OFFSET
    match (stmt.limit, stmt.offset) {
        (Some(limit), Some(offset)) => {
            sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset))
        }
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
        (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
        (None, None) => {}
    }

    // Placeholders in the join come before those in WHERE and ORDER BY.
    join_params.extend(params);
    Ok(CompiledQuery {
        sql,
        params: join_params,
    })
}

fn search_text<'a>(stmt: &'a SelectStatement, param: &str) -> Result<&'a str, BackendError> {
    stmt.params
        .get(param)
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Query(format!("unbound parameter ${}", param)))
}

/// `None` for a relevance key when nothing was ranked.
fn compile_order_key(
    key: &OrderKey,
    ranked: bool,
    params: &mut Vec<SqlValue>,
) -> Option<String> {
    let dir = match key.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    match &key.key {
        SortKey::DocumentKey => Some(format!("{}.key {}", TABLE_ALIAS, dir)),
        SortKey::Field(field) => Some(format!("{} {}", field_expr(field, params), dir)),
        // bm25 is lower for better matches.
        SortKey::Relevance => ranked.then(|| {
            let dir = match key.order {
                SortOrder::Asc => "DESC",
                SortOrder::Desc => "ASC",
            };
            format!("{}.score {}", MATCH_ALIAS, dir)
        }),
    }
}

/// Map a document field to a SQL expression.
///
/// Plain identifiers are inlined so expression indexes apply; anything else
/// is bound as a JSON path parameter.
fn field_expr(field: &str, params: &mut Vec<SqlValue>) -> String {
    match json_path_literal(field) {
        Some(literal) => format!("json_extract(doc, {})", literal),
        None => {
            params.push(SqlValue::Text(json_path(field)));
            "json_extract(doc, ?)".to_string()
        }
    }
}

/// JSON path selecting a top-level member.
pub(crate) fn json_path(field: &str) -> String {
    format!("$.\"{}\"", field.replace('"', "\\\""))
}

/// Quoted SQL string literal of the JSON path, for plain identifier fields.
pub(crate) fn json_path_literal(field: &str) -> Option<String> {
    let plain = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    plain.then(|| format!("'$.\"{}\"'", field))
}

/// Quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Turn free text into an FTS5 prefix query; every term must match.
///
/// Terms without any letter or digit produce no tokens and are dropped.
pub(crate) fn fts_query(text: &str) -> String {
    text.split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| format!("\"{}\"*", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}
