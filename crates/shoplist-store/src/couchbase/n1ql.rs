use std::collections::BTreeMap;

use serde_json::Value;

use crate::cluster::{BackendError, FieldUpdate, Keyspace};
use crate::query::SortOrder;
use crate::statement::{Condition, OrderKey, Projection, SelectStatement, SortKey};

/// Alias every rendered statement uses for the collection.
const ALIAS: &str = "x";

/// N1QL text with named parameters (`$name`).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct N1qlStatement {
    pub text: String,
    pub params: BTreeMap<String, Value>,
}

impl N1qlStatement {
    fn new(text: String) -> Self {
        Self {
            text,
            params: BTreeMap::new(),
        }
    }

    fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

/// Backtick-quote an identifier.
pub(crate) fn escape_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// `` `bucket`.`scope`.`collection` ``
pub(crate) fn keyspace_path(ks: &Keyspace) -> String {
    format!(
        "{}.{}.{}",
        escape_ident(&ks.bucket),
        escape_ident(&ks.scope),
        escape_ident(&ks.collection)
    )
}

pub(crate) fn create_primary_index(ks: &Keyspace) -> N1qlStatement {
    N1qlStatement::new(format!("CREATE PRIMARY INDEX ON {}", keyspace_path(ks)))
}

pub(crate) fn create_index(ks: &Keyspace, name: &str, fields: &[String]) -> N1qlStatement {
    let fields: Vec<String> = fields.iter().map(|f| escape_ident(f)).collect();
    N1qlStatement::new(format!(
        "CREATE INDEX {} ON {}({})",
        escape_ident(name),
        keyspace_path(ks),
        fields.join(", ")
    ))
}

pub(crate) fn get(ks: &Keyspace, key: &str) -> N1qlStatement {
    N1qlStatement::new(format!(
        "SELECT RAW {a} FROM {} AS {a} USE KEYS $key",
        keyspace_path(ks),
        a = ALIAS
    ))
    .bind("key", key)
}

pub(crate) fn upsert(ks: &Keyspace, key: &str, doc: &Value) -> N1qlStatement {
    N1qlStatement::new(format!(
        "UPSERT INTO {} (KEY, VALUE) VALUES ($key, $doc)",
        keyspace_path(ks)
    ))
    .bind("key", key)
    .bind("doc", doc.clone())
}

/// `UPDATE ... SET` over the named fields; returns the key when it matched.
pub(crate) fn mutate_in(ks: &Keyspace, key: &str, updates: &[FieldUpdate]) -> N1qlStatement {
    let mut assignments = Vec::with_capacity(updates.len());
    let mut stmt = N1qlStatement::new(String::new()).bind("key", key);
    for (i, update) in updates.iter().enumerate() {
        let param = format!("v{}", i);
        assignments.push(format!(
            "{}.{} = ${}",
            ALIAS,
            escape_ident(&update.path),
            param
        ));
        stmt = stmt.bind(&param, update.value.clone());
    }
    stmt.text = format!(
        "UPDATE {} AS {a} USE KEYS $key SET {} RETURNING META({a}).id",
        keyspace_path(ks),
        assignments.join(", "),
        a = ALIAS
    );
    stmt
}

pub(crate) fn remove(ks: &Keyspace, key: &str) -> N1qlStatement {
    N1qlStatement::new(format!(
        "DELETE FROM {} AS {a} USE KEYS $key RETURNING META({a}).id",
        keyspace_path(ks),
        a = ALIAS
    ))
    .bind("key", key)
}

/// Render a select statement over `ks`.
pub(crate) fn render_select(
    stmt: &SelectStatement,
    ks: &Keyspace,
) -> Result<N1qlStatement, BackendError> {
    let mut params = BTreeMap::new();

    let projection = match stmt.projection {
        Projection::Rows => format!("META({a}).id AS id, {a}.*", a = ALIAS),
        Projection::Count => "COUNT(*) AS total".to_string(),
    };

    let mut conditions = vec!["1 = 1".to_string()];
    let mut searched = false;
    for condition in &stmt.conditions {
        match condition {
            Condition::BoughtEquals(bought) => {
                params.insert("bought".to_string(), Value::Bool(*bought));
                conditions.push(format!("{}.{} = $bought", ALIAS, escape_ident("bought")));
            }
            Condition::Search { param } => {
                let text = stmt
                    .params
                    .get(param)
                    .and_then(Value::as_str)
                    .ok_or_else(|| BackendError::Query(format!("unbound parameter ${}", param)))?;
                let query = search_query_string(text);
                if query.is_empty() {
                    conditions.push("FALSE".to_string());
                } else {
                    params.insert(param.clone(), Value::String(query));
                    conditions.push(format!("SEARCH({}, ${})", ALIAS, param));
                    searched = true;
                }
            }
        }
    }

    let mut text = format!(
        "SELECT {} FROM {} AS {} WHERE {}",
        projection,
        keyspace_path(ks),
        ALIAS,
        conditions.join(" AND ")
    );

    let keys: Vec<String> = stmt
        .order_by
        .iter()
        .filter_map(|key| order_key(key, searched))
        .collect();
    if !keys.is_empty() {
        text.push_str(&format!(" ORDER BY {}", keys.join(", ")));
    }
    if let Some(limit) = stmt.limit {
        text.push_str(&format!(" LIMIT {}", limit));
    }
    if let Some(offset) = stmt.offset {
        text.push_str(&format!(" OFFSET {}", offset));
    }

    Ok(N1qlStatement { text, params })
}

/// `None` for a relevance key without a `SEARCH` to score.
fn order_key(key: &OrderKey, searched: bool) -> Option<String> {
    let dir = match key.order {
        SortOrder::Asc => "ASC",
        SortOrder::Desc => "DESC",
    };
    match &key.key {
        SortKey::DocumentKey => Some(format!("META({}).id {}", ALIAS, dir)),
        SortKey::Field(field) => Some(format!("{}.{} {}", ALIAS, escape_ident(field), dir)),
        SortKey::Relevance => searched.then(|| format!("SEARCH_SCORE({}) {}", ALIAS, dir)),
    }
}

/// Turn free text into a query-string search where every term must match as
/// a prefix.
pub(crate) fn search_query_string(text: &str) -> String {
    const SPECIAL: &[char] = &[
        '+', '-', '=', '&', '|', '>', '<', '!', '(', ')', '{', '}', '[', ']', '^', '"', '~',
        '*', '?', ':', '\\', '/',
    ];
    text.split_whitespace()
        .filter(|term| term.chars().any(char::is_alphanumeric))
        .map(|term| {
            let mut escaped = String::with_capacity(term.len() + 2);
            escaped.push('+');
            for c in term.to_lowercase().chars() {
                if SPECIAL.contains(&c) {
                    escaped.push('\\');
                }
                escaped.push(c);
            }
            escaped.push('*');
            escaped
        })
        .collect::<Vec<_>>()
        .join(" ")
}
