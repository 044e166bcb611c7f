//! Scripted cluster used to drive bootstrap and executor failure paths

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use shoplist_store::cluster::{EndpointPing, PingState, ServiceType};
use shoplist_store::statement::{Projection, SelectStatement};
use shoplist_store::{BackendError, Cluster, FieldUpdate, Keyspace, PingReport};

/// Failure a scripted call produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Exists,
    Timeout,
    BucketMissing,
    DocumentMissing,
    Unavailable,
    Storage,
}

impl Fault {
    fn error(self, what: &str) -> BackendError {
        match self {
            Fault::Exists => BackendError::AlreadyExists(what.to_string()),
            Fault::Timeout => BackendError::Timeout,
            Fault::BucketMissing => BackendError::BucketNotFound(what.to_string()),
            Fault::DocumentMissing => BackendError::DocumentNotFound(what.to_string()),
            Fault::Unavailable => BackendError::Unavailable(what.to_string()),
            Fault::Storage => BackendError::Storage(format!("{} failed", what)),
        }
    }
}

#[derive(Default)]
struct Script {
    /// Outcomes of successive `wait_until_ready` calls; `Ok` once drained.
    ready: VecDeque<Fault>,
    /// Standing failures keyed by operation name.
    faults: HashMap<&'static str, Fault>,
    rows: Vec<Value>,
    count: Vec<Value>,
    rows_delay: Duration,
    count_delay: Duration,
    unhealthy: bool,
}

/// A [`Cluster`] whose answers are set up by the test.
///
/// Operation names used for faults: `create_bucket`, `create_scope`,
/// `create_collection`, `create_primary_index`, `create_index`,
/// `create_search_index`, `get`, `upsert`, `mutate_in`, `remove`,
/// `query_rows`, `query_count`.
#[derive(Default)]
pub struct MockCluster {
    script: Mutex<Script>,
    calls: Mutex<Vec<String>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ready_sequence(self, outcomes: &[Fault]) -> Self {
        self.script.lock().unwrap().ready = outcomes.iter().copied().collect();
        self
    }

    pub fn fail(self, op: &'static str, fault: Fault) -> Self {
        self.script.lock().unwrap().faults.insert(op, fault);
        self
    }

    pub fn rows(self, rows: Vec<Value>) -> Self {
        self.script.lock().unwrap().rows = rows;
        self
    }

    pub fn count(self, count: Vec<Value>) -> Self {
        self.script.lock().unwrap().count = count;
        self
    }

    pub fn delays(self, rows: Duration, count: Duration) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            script.rows_delay = rows;
            script.count_delay = count;
        }
        self
    }

    pub fn unhealthy(self) -> Self {
        self.script.lock().unwrap().unhealthy = true;
        self
    }

    /// Calls made so far, as `op:subject`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, op: &str) -> bool {
        let prefix = format!("{}:", op);
        self.calls().iter().any(|c| c.starts_with(&prefix))
    }

    fn record(&self, op: &'static str, subject: &str) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(format!("{}:{}", op, subject));
        match self.script.lock().unwrap().faults.get(op) {
            Some(fault) => Err(fault.error(subject)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Cluster for MockCluster {
    fn engine(&self) -> &'static str {
        "mock"
    }

    async fn wait_until_ready(&self, bucket: &str, _timeout: Duration) -> Result<(), BackendError> {
        self.calls.lock().unwrap().push(format!("wait_until_ready:{}", bucket));
        match self.script.lock().unwrap().ready.pop_front() {
            Some(fault) => Err(fault.error(bucket)),
            None => Ok(()),
        }
    }

    async fn create_bucket(&self, bucket: &str, _ram_quota_mb: u64) -> Result<(), BackendError> {
        self.record("create_bucket", bucket)
    }

    async fn create_scope(&self, _bucket: &str, scope: &str) -> Result<(), BackendError> {
        self.record("create_scope", scope)
    }

    async fn create_collection(&self, keyspace: &Keyspace) -> Result<(), BackendError> {
        self.record("create_collection", &keyspace.collection)
    }

    async fn create_primary_index(&self, keyspace: &Keyspace) -> Result<(), BackendError> {
        self.record("create_primary_index", &keyspace.collection)
    }

    async fn create_index(
        &self,
        _keyspace: &Keyspace,
        name: &str,
        _fields: &[String],
    ) -> Result<(), BackendError> {
        self.record("create_index", name)
    }

    async fn create_search_index(
        &self,
        _keyspace: &Keyspace,
        name: &str,
        _fields: &[String],
    ) -> Result<(), BackendError> {
        self.record("create_search_index", name)
    }

    async fn get(&self, _keyspace: &Keyspace, key: &str) -> Result<Value, BackendError> {
        self.record("get", key)?;
        Err(BackendError::DocumentNotFound(key.to_string()))
    }

    async fn upsert(
        &self,
        _keyspace: &Keyspace,
        key: &str,
        _doc: &Value,
    ) -> Result<(), BackendError> {
        self.record("upsert", key)
    }

    async fn mutate_in(
        &self,
        _keyspace: &Keyspace,
        key: &str,
        _updates: &[FieldUpdate],
    ) -> Result<(), BackendError> {
        self.record("mutate_in", key)
    }

    async fn remove(&self, _keyspace: &Keyspace, key: &str) -> Result<(), BackendError> {
        self.record("remove", key)
    }

    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &SelectStatement,
    ) -> Result<Vec<Value>, BackendError> {
        let (op, delay) = {
            let script = self.script.lock().unwrap();
            match statement.projection {
                Projection::Rows => ("query_rows", script.rows_delay),
                Projection::Count => ("query_count", script.count_delay),
            }
        };
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", op, keyspace.collection));
        tokio::time::sleep(delay).await;

        let script = self.script.lock().unwrap();
        if let Some(fault) = script.faults.get(op) {
            return Err(fault.error(op));
        }
        Ok(match statement.projection {
            Projection::Rows => script.rows.clone(),
            Projection::Count => script.count.clone(),
        })
    }

    async fn ping(&self, bucket: &str) -> Result<PingReport, BackendError> {
        let unhealthy = self.script.lock().unwrap().unhealthy;
        let mut report = PingReport::new(format!("mock:{}", bucket));
        report.add(
            ServiceType::Kv,
            EndpointPing {
                remote: "mock".to_string(),
                state: if unhealthy { PingState::Timeout } else { PingState::Ok },
                latency_us: 1,
                error: unhealthy.then(|| "no answer".to_string()),
            },
        );
        Ok(report)
    }
}
