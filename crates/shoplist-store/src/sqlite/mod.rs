//! Embedded document engine on SQLite.
//!
//! Each collection is a table of `(key, doc)` rows with the document kept as
//! JSON text. Secondary indexes are expression indexes over `json_extract`,
//! and a collection's search index is an FTS5 table refreshed on every write.
//! Buckets, scopes, collections and indexes are tracked in catalog tables so
//! that creating any of them twice reports "already exists".
//!
//! Writes go through one connection. File databases read through a pool of
//! WAL readers so reads do not queue behind each other or behind a write; an
//! in-memory database only exists on its one connection. Every statement is
//! bound to the future awaiting it: dropping that future interrupts the
//! statement, or keeps it from starting if it is still waiting for a
//! connection.

mod render;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;

use crate::cluster::{
    BackendError, Cluster, EndpointPing, FieldUpdate, Keyspace, PingReport, PingState,
    ServiceType,
};
use crate::statement::{Condition, Projection, SelectStatement};
use render::{compile_select, json_path_literal, quote_ident};

const PRIMARY_INDEX: &str = "#primary";

/// Reader connections kept for a file database.
const READ_POOL_SIZE: u32 = 4;

/// How long a reader waits on a locked database before giving up.
const READ_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Virtual machine steps between cancellation checks.
const PROGRESS_STEPS: i32 = 1_000;

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        BackendError::Storage(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

/// Set when the future awaiting a statement is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// SQLite-backed implementation of the [`Cluster`] trait.
pub struct SqliteCluster {
    writer: Arc<Mutex<Connection>>,
    /// `None` for in-memory databases, which read through the writer.
    readers: Option<Pool<SqliteConnectionManager>>,
    label: String,
}

impl SqliteCluster {
    /// Open (or create) a database at the given path.
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let conn =
            Connection::open(path).map_err(|e| BackendError::Storage(format!("open: {}", e)))?;
        Self::init_schema(&conn)?;

        let manager = SqliteConnectionManager::file(path)
            .with_init(|conn| conn.busy_timeout(READ_BUSY_TIMEOUT));
        let readers = Pool::builder()
            .max_size(READ_POOL_SIZE)
            .build(manager)
            .map_err(|e| BackendError::Storage(format!("read pool: {}", e)))?;

        Ok(Self::from_parts(conn, Some(readers), path.display().to_string()))
    }

    /// Create an in-memory database.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BackendError::Storage(format!("open_in_memory: {}", e)))?;
        Self::init_schema(&conn)?;
        Ok(Self::from_parts(conn, None, ":memory:".to_string()))
    }

    fn from_parts(
        conn: Connection,
        readers: Option<Pool<SqliteConnectionManager>>,
        label: String,
    ) -> Self {
        tracing::debug!(
            "Opened embedded cluster at {} ({} readers)",
            label,
            readers.as_ref().map_or(0, |pool| pool.max_size())
        );
        Self {
            writer: Arc::new(Mutex::new(conn)),
            readers,
            label,
        }
    }

    fn init_schema(conn: &Connection) -> Result<(), BackendError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS shoplist_buckets (
                name TEXT PRIMARY KEY,
                ram_quota_mb INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS shoplist_scopes (
                bucket TEXT NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (bucket, name)
            );

            CREATE TABLE IF NOT EXISTS shoplist_collections (
                id INTEGER PRIMARY KEY,
                bucket TEXT NOT NULL,
                scope TEXT NOT NULL,
                name TEXT NOT NULL,
                UNIQUE (bucket, scope, name)
            );

            CREATE TABLE IF NOT EXISTS shoplist_indexes (
                collection_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                fields TEXT NOT NULL,
                PRIMARY KEY (collection_id, name)
            );
            ",
        )
        .map_err(|e| BackendError::Storage(format!("init_schema: {}", e)))
    }

    /// Run `f` on the blocking pool against a reader or the writer.
    ///
    /// Dropping the returned future interrupts `f`'s statements.
    async fn run<T, F>(&self, access: Access, f: F) -> Result<T, BackendError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel = CancelOnDrop(Arc::clone(&cancelled));
        let writer = Arc::clone(&self.writer);
        let readers = match access {
            Access::Read => self.readers.clone(),
            Access::Write => None,
        };

        tokio::task::spawn_blocking(move || match readers {
            Some(pool) => {
                let mut conn = pool
                    .get()
                    .map_err(|e| BackendError::Unavailable(format!("read pool: {}", e)))?;
                interruptible(&mut *conn, &cancelled, f)
            }
            None => {
                let mut guard = writer
                    .lock()
                    .map_err(|e| BackendError::Storage(format!("lock: {}", e)))?;
                interruptible(&mut *guard, &cancelled, f)
            }
        })
        .await
        .map_err(|e| BackendError::Storage(format!("blocking task: {}", e)))?
    }
}

/// Run `f` with a progress handler that aborts once `cancelled` is set.
fn interruptible<T, F>(
    conn: &mut Connection,
    cancelled: &Arc<AtomicBool>,
    f: F,
) -> Result<T, BackendError>
where
    F: FnOnce(&mut Connection) -> Result<T, BackendError>,
{
    if cancelled.load(Ordering::Relaxed) {
        return Err(BackendError::Query("cancelled before start".to_string()));
    }
    let flag = Arc::clone(cancelled);
    conn.progress_handler(PROGRESS_STEPS, Some(move || flag.load(Ordering::Relaxed)));
    let result = f(conn);
    conn.progress_handler(PROGRESS_STEPS, None::<fn() -> bool>);
    result
}

impl std::fmt::Debug for SqliteCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCluster")
            .field("label", &self.label)
            .finish()
    }
}

#[async_trait]
impl Cluster for SqliteCluster {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    async fn wait_until_ready(&self, bucket: &str, timeout: Duration) -> Result<(), BackendError> {
        let name = bucket.to_string();
        let lookup = self.run(Access::Read, move |conn| bucket_exists(conn, &name));
        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(BackendError::BucketNotFound(bucket.to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BackendError::Timeout),
        }
    }

    async fn create_bucket(&self, bucket: &str, ram_quota_mb: u64) -> Result<(), BackendError> {
        let name = bucket.to_string();
        let quota = i64::try_from(ram_quota_mb).unwrap_or(i64::MAX);
        self.run(Access::Write, move |conn| {
            insert_unique(
                conn,
                "INSERT INTO shoplist_buckets (name, ram_quota_mb) VALUES (?1, ?2)",
                params![name, quota],
                &format!("bucket {}", name),
            )
        })
        .await?;
        tracing::debug!("Created bucket {}", bucket);
        Ok(())
    }

    async fn create_scope(&self, bucket: &str, scope: &str) -> Result<(), BackendError> {
        let (bucket, scope) = (bucket.to_string(), scope.to_string());
        self.run(Access::Write, move |conn| {
            if !bucket_exists(conn, &bucket)? {
                return Err(BackendError::BucketNotFound(bucket));
            }
            insert_unique(
                conn,
                "INSERT INTO shoplist_scopes (bucket, name) VALUES (?1, ?2)",
                params![bucket, scope],
                &format!("scope {}.{}", bucket, scope),
            )
        })
        .await
    }

    async fn create_collection(&self, keyspace: &Keyspace) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        self.run(Access::Write, move |conn| {
            let scope_known = conn
                .query_row(
                    "SELECT 1 FROM shoplist_scopes WHERE bucket = ?1 AND name = ?2",
                    params![ks.bucket, ks.scope],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if !scope_known {
                return Err(BackendError::Storage(format!(
                    "scope not found: {}.{}",
                    ks.bucket, ks.scope
                )));
            }

            let tx = conn.transaction()?;
            insert_unique(
                &tx,
                "INSERT INTO shoplist_collections (bucket, scope, name) VALUES (?1, ?2, ?3)",
                params![ks.bucket, ks.scope, ks.collection],
                &format!("collection {}", ks),
            )?;
            let table = table_name(tx.last_insert_rowid());
            tx.execute_batch(&format!(
                "CREATE TABLE {} (key TEXT PRIMARY KEY, doc TEXT NOT NULL);",
                quote_ident(&table)
            ))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_primary_index(&self, keyspace: &Keyspace) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        // The key column's PRIMARY KEY already serves key scans.
        self.run(Access::Write, move |conn| {
            let id = require_collection(conn, &ks)?;
            insert_unique(
                conn,
                "INSERT INTO shoplist_indexes (collection_id, name, kind, fields) \
                 VALUES (?1, ?2, 'primary', '[]')",
                params![id, PRIMARY_INDEX],
                &format!("primary index on {}", ks),
            )
        })
        .await
    }

    async fn create_index(
        &self,
        keyspace: &Keyspace,
        name: &str,
        fields: &[String],
    ) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        let name = name.to_string();
        let fields = fields.to_vec();
        self.run(Access::Write, move |conn| {
            let mut exprs = Vec::with_capacity(fields.len());
            for field in &fields {
                let literal = json_path_literal(field).ok_or_else(|| {
                    BackendError::Query(format!("cannot index field {:?}", field))
                })?;
                exprs.push(format!("json_extract(doc, {})", literal));
            }
            if exprs.is_empty() {
                return Err(BackendError::Query(format!("index {} has no fields", name)));
            }

            let tx = conn.transaction()?;
            let id = require_collection(&tx, &ks)?;
            insert_unique(
                &tx,
                "INSERT INTO shoplist_indexes (collection_id, name, kind, fields) \
                 VALUES (?1, ?2, 'secondary', ?3)",
                params![id, name, serde_json::to_string(&fields)?],
                &format!("index {} on {}", name, ks),
            )?;
            let table = table_name(id);
            tx.execute_batch(&format!(
                "CREATE INDEX {} ON {} ({});",
                quote_ident(&format!("{}_{}", table, name)),
                quote_ident(&table),
                exprs.join(", ")
            ))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn create_search_index(
        &self,
        keyspace: &Keyspace,
        name: &str,
        fields: &[String],
    ) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        let name = name.to_string();
        let fields = fields.to_vec();
        self.run(Access::Write, move |conn| {
            let tx = conn.transaction()?;
            let id = require_collection(&tx, &ks)?;
            // One FTS table per collection.
            if search_fields(&tx, id)?.is_some() {
                return Err(BackendError::AlreadyExists(format!(
                    "search index on {}",
                    ks
                )));
            }
            insert_unique(
                &tx,
                "INSERT INTO shoplist_indexes (collection_id, name, kind, fields) \
                 VALUES (?1, ?2, 'search', ?3)",
                params![id, name, serde_json::to_string(&fields)?],
                &format!("search index {} on {}", name, ks),
            )?;
            tx.execute_batch(&format!(
                "CREATE VIRTUAL TABLE {} USING fts5(key UNINDEXED, body);",
                quote_ident(&fts_name(id))
            ))?;

            // Backfill documents written before the index existed.
            let existing: Vec<(String, String)> = {
                let mut stmt =
                    tx.prepare(&format!("SELECT key, doc FROM {}", quote_ident(&table_name(id))))?;
                let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<Result<_, _>>()?
            };
            for (key, doc) in existing {
                let doc: Value = serde_json::from_str(&doc)?;
                sync_fts(&tx, id, &key, Some(&doc))?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Value, BackendError> {
        let ks = keyspace.clone();
        let key = key.to_string();
        self.run(Access::Read, move |conn| {
            let id = require_collection(conn, &ks)?;
            let doc: Option<String> = conn
                .query_row(
                    &format!("SELECT doc FROM {} WHERE key = ?1", quote_ident(&table_name(id))),
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match doc {
                Some(doc) => Ok(serde_json::from_str(&doc)?),
                None => Err(BackendError::DocumentNotFound(key)),
            }
        })
        .await
    }

    async fn upsert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        doc: &Value,
    ) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        let key = key.to_string();
        let doc = doc.clone();
        self.run(Access::Write, move |conn| {
            let tx = conn.transaction()?;
            let id = require_collection(&tx, &ks)?;
            tx.execute(
                &format!(
                    "INSERT INTO {} (key, doc) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET doc = excluded.doc",
                    quote_ident(&table_name(id))
                ),
                params![key, serde_json::to_string(&doc)?],
            )?;
            sync_fts(&tx, id, &key, Some(&doc))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mutate_in(
        &self,
        keyspace: &Keyspace,
        key: &str,
        updates: &[FieldUpdate],
    ) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        let key = key.to_string();
        let updates = updates.to_vec();
        self.run(Access::Write, move |conn| {
            let tx = conn.transaction()?;
            let id = require_collection(&tx, &ks)?;
            let table = quote_ident(&table_name(id));

            let current: Option<String> = tx
                .query_row(
                    &format!("SELECT doc FROM {} WHERE key = ?1", table),
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(current) = current else {
                return Err(BackendError::DocumentNotFound(key));
            };

            let mut doc: Value = serde_json::from_str(&current)?;
            let fields = doc.as_object_mut().ok_or_else(|| {
                BackendError::Storage(format!("document {} is not an object", key))
            })?;
            for update in updates {
                fields.insert(update.path, update.value);
            }

            tx.execute(
                &format!("UPDATE {} SET doc = ?1 WHERE key = ?2", table),
                params![serde_json::to_string(&doc)?, key],
            )?;
            sync_fts(&tx, id, &key, Some(&doc))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, keyspace: &Keyspace, key: &str) -> Result<(), BackendError> {
        let ks = keyspace.clone();
        let key = key.to_string();
        self.run(Access::Write, move |conn| {
            let tx = conn.transaction()?;
            let id = require_collection(&tx, &ks)?;
            let removed = tx.execute(
                &format!("DELETE FROM {} WHERE key = ?1", quote_ident(&table_name(id))),
                params![key],
            )?;
            if removed == 0 {
                return Err(BackendError::DocumentNotFound(key));
            }
            sync_fts(&tx, id, &key, None)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &SelectStatement,
    ) -> Result<Vec<Value>, BackendError> {
        let ks = keyspace.clone();
        let statement = statement.clone();
        self.run(Access::Read, move |conn| {
            let id = require_collection(conn, &ks)?;
            let searches = statement
                .conditions
                .iter()
                .any(|c| matches!(c, Condition::Search { .. }));
            if searches && search_fields(conn, id)?.is_none() {
                return Err(BackendError::Query(format!("no search index on {}", ks)));
            }

            let compiled = compile_select(
                &statement,
                &quote_ident(&table_name(id)),
                &quote_ident(&fts_name(id)),
            )?;
            tracing::debug!("SQL: {}", compiled.sql);

            let query_err = |e: rusqlite::Error| BackendError::Query(e.to_string());
            let mut stmt = conn.prepare(&compiled.sql).map_err(query_err)?;
            let params = params_from_iter(compiled.params.iter());

            match statement.projection {
                Projection::Count => {
                    let total: i64 = stmt
                        .query_row(params, |row| row.get(0))
                        .map_err(query_err)?;
                    Ok(vec![serde_json::json!({ "total": total })])
                }
                Projection::Rows => {
                    let rows = stmt
                        .query_map(params, |row| {
                            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                        })
                        .map_err(query_err)?;
                    let mut docs = Vec::new();
                    for row in rows {
                        let (key, doc) = row.map_err(query_err)?;
                        let mut doc: Value = serde_json::from_str(&doc)?;
                        if let Some(fields) = doc.as_object_mut() {
                            fields.insert("id".to_string(), Value::String(key));
                        }
                        docs.push(doc);
                    }
                    Ok(docs)
                }
            }
        })
        .await
    }

    async fn ping(&self, bucket: &str) -> Result<PingReport, BackendError> {
        let name = bucket.to_string();
        let label = self.label.clone();
        self.run(Access::Read, move |conn| {
            let mut report = PingReport::new(format!("sqlite:{}", label));

            let started = Instant::now();
            let kv = match bucket_exists(conn, &name) {
                Ok(true) => Ok(()),
                Ok(false) => Err(format!("bucket not found: {}", name)),
                Err(e) => Err(e.to_string()),
            };
            report.add(ServiceType::Kv, endpoint(&label, started, kv));

            let started = Instant::now();
            let query = conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| e.to_string());
            report.add(ServiceType::Query, endpoint(&label, started, query));

            Ok(report)
        })
        .await
    }
}

fn table_name(collection_id: i64) -> String {
    format!("c{}", collection_id)
}

fn fts_name(collection_id: i64) -> String {
    format!("c{}_fts", collection_id)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Insert a catalog row, reporting a key clash as "already exists".
fn insert_unique(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    what: &str,
) -> Result<(), BackendError> {
    match conn.execute(sql, params) {
        Ok(_) => Ok(()),
        Err(e) if is_constraint_violation(&e) => Err(BackendError::AlreadyExists(what.to_string())),
        Err(e) => Err(e.into()),
    }
}

fn bucket_exists(conn: &Connection, bucket: &str) -> Result<bool, BackendError> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM shoplist_buckets WHERE name = ?1",
            params![bucket],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn require_collection(conn: &Connection, ks: &Keyspace) -> Result<i64, BackendError> {
    conn.query_row(
        "SELECT id FROM shoplist_collections WHERE bucket = ?1 AND scope = ?2 AND name = ?3",
        params![ks.bucket, ks.scope, ks.collection],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| BackendError::Storage(format!("collection not found: {}", ks)))
}

/// Fields covered by the collection's search index, if it has one.
fn search_fields(
    conn: &Connection,
    collection_id: i64,
) -> Result<Option<Vec<String>>, BackendError> {
    let fields: Option<String> = conn
        .query_row(
            "SELECT fields FROM shoplist_indexes WHERE collection_id = ?1 AND kind = 'search'",
            params![collection_id],
            |row| row.get(0),
        )
        .optional()?;
    match fields {
        Some(fields) => Ok(Some(serde_json::from_str(&fields)?)),
        None => Ok(None),
    }
}

/// Bring the search entry for `key` in line with `doc` (`None` drops it).
fn sync_fts(
    conn: &Connection,
    collection_id: i64,
    key: &str,
    doc: Option<&Value>,
) -> Result<(), BackendError> {
    let Some(fields) = search_fields(conn, collection_id)? else {
        return Ok(());
    };
    let fts = quote_ident(&fts_name(collection_id));
    conn.execute(&format!("DELETE FROM {} WHERE key = ?1", fts), params![key])?;
    if let Some(doc) = doc {
        conn.execute(
            &format!("INSERT INTO {} (key, body) VALUES (?1, ?2)", fts),
            params![key, search_body(doc, &fields)],
        )?;
    }
    Ok(())
}

fn search_body(doc: &Value, fields: &[String]) -> String {
    fields
        .iter()
        .filter_map(|field| match doc.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn endpoint(remote: &str, started: Instant, outcome: Result<(), String>) -> EndpointPing {
    let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
    let (state, error) = match outcome {
        Ok(()) => (PingState::Ok, None),
        Err(e) => (PingState::Error, Some(e)),
    };
    EndpointPing {
        remote: remote.to_string(),
        state,
        latency_us,
        error,
    }
}
