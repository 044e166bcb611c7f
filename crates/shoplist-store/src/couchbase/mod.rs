//! Couchbase Server engine over the management, query and search REST
//! services.
//!
//! Topology calls go to the cluster manager, every key-value and select
//! statement is N1QL sent to the query service, and the search index
//! definition is installed through the search service.

mod n1ql;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cluster::{
    BackendError, Cluster, EndpointPing, FieldUpdate, Keyspace, PingReport, PingState,
    ServiceType,
};
use crate::config::ConnectionConfig;
use crate::statement::SelectStatement;
use n1ql::N1qlStatement;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// REST endpoints derived from a connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub mgmt: String,
    pub query: String,
    pub search: String,
}

impl Endpoints {
    /// Derive endpoints from the first host of a `couchbase://`,
    /// `couchbases://`, `http://` or `https://` connection string.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, BackendError> {
        let s = connection_string.trim();
        let (tls, rest) = if let Some(rest) = s.strip_prefix("couchbases://") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("couchbase://") {
            (false, rest)
        } else if let Some(rest) = s.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = s.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(BackendError::Unavailable(format!(
                "unsupported connection string: {:?}",
                s
            )));
        };

        let host = rest
            .split(',')
            .next()
            .unwrap_or_default()
            .split(|c: char| c == '/' || c == '?')
            .next()
            .unwrap_or_default();
        // Drop any port; services live on their well-known ports.
        let host = match host.strip_prefix('[') {
            Some(v6) => match v6.split_once(']') {
                Some((addr, _)) => format!("[{}]", addr),
                None => host.to_string(),
            },
            None => host.split(':').next().unwrap_or_default().to_string(),
        };
        if host.is_empty() || host == "[]" {
            return Err(BackendError::Unavailable(format!(
                "no host in connection string {:?}",
                s
            )));
        }

        let (scheme, mgmt, query, search) = if tls {
            ("https", 18091, 18093, 18094)
        } else {
            ("http", 8091, 8093, 8094)
        };
        Ok(Self {
            mgmt: format!("{}://{}:{}", scheme, host, mgmt),
            query: format!("{}://{}:{}", scheme, host, query),
            search: format!("{}://{}:{}", scheme, host, search),
        })
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    errors: Vec<QueryIssue>,
}

#[derive(Debug, Deserialize)]
struct QueryIssue {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
}

/// Couchbase-backed implementation of the [`Cluster`] trait.
pub struct CouchbaseCluster {
    client: Client,
    endpoints: Endpoints,
    username: String,
    password: String,
}

impl std::fmt::Debug for CouchbaseCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchbaseCluster")
            .field("endpoints", &self.endpoints)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl CouchbaseCluster {
    /// Build a client for the cluster and check the credentials.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, BackendError> {
        let endpoints = Endpoints::from_connection_string(&config.connection_string)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("shoplist-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BackendError::Unavailable(format!("http client: {}", e)))?;

        let cluster = Self {
            client,
            endpoints,
            username: config.username.clone(),
            password: config.password.clone(),
        };

        let url = cluster.mgmt_url(&["pools"])?;
        let (status, body) = cluster.send(cluster.client.get(url)).await?;
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!(
                "cluster manager answered {}: {}",
                status, body
            )));
        }
        tracing::info!("Connected to cluster manager at {}", cluster.endpoints.mgmt);
        Ok(cluster)
    }

    fn mgmt_url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        service_url(&self.endpoints.mgmt, segments)
    }

    /// Send with credentials and return status and body.
    async fn send(&self, request: RequestBuilder) -> Result<(StatusCode, String), BackendError> {
        let response = request
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BackendError::Authentication(format!("{}: {}", status, body)));
        }
        Ok((status, body))
    }

    /// POST a management form and classify the outcome.
    async fn mgmt_post(
        &self,
        segments: &[&str],
        form: &[(&str, String)],
        what: &str,
    ) -> Result<(), BackendError> {
        let url = self.mgmt_url(segments)?;
        let (status, body) = self.send(self.client.post(url).form(form)).await?;
        if status.is_success() {
            tracing::debug!("Created {}", what);
            return Ok(());
        }
        Err(mgmt_error(status, &body, what))
    }

    /// Run a N1QL statement and return its result rows.
    async fn run(&self, stmt: &N1qlStatement) -> Result<Vec<Value>, BackendError> {
        let url = service_url(&self.endpoints.query, &["query", "service"])?;
        let mut body = serde_json::Map::new();
        body.insert("statement".to_string(), Value::String(stmt.text.clone()));
        for (name, value) in &stmt.params {
            body.insert(format!("${}", name), value.clone());
        }
        tracing::debug!("N1QL: {}", stmt.text);

        let (status, text) = self.send(self.client.post(url).json(&body)).await?;
        let response: QueryResponse = serde_json::from_str(&text).map_err(|e| {
            BackendError::Query(format!("unreadable response ({}): {}", status, e))
        })?;
        if !response.errors.is_empty() {
            return Err(query_error(&response.errors));
        }
        if response.status == "timeout" {
            return Err(BackendError::Timeout);
        }
        if !status.is_success() {
            return Err(BackendError::Query(format!("query service answered {}", status)));
        }
        Ok(response.results)
    }

    async fn bucket_info(&self, bucket: &str) -> Result<Option<Value>, BackendError> {
        let url = self.mgmt_url(&["pools", "default", "buckets", bucket])?;
        let (status, body) = self.send(self.client.get(url)).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(mgmt_error(status, &body, &format!("bucket {}", bucket)));
        }
        Ok(Some(serde_json::from_str(&body)?))
    }
}

#[async_trait]
impl Cluster for CouchbaseCluster {
    fn engine(&self) -> &'static str {
        "couchbase"
    }

    async fn wait_until_ready(&self, bucket: &str, timeout: Duration) -> Result<(), BackendError> {
        let poll = async {
            loop {
                match self.bucket_info(bucket).await {
                    Ok(None) => return Err(BackendError::BucketNotFound(bucket.to_string())),
                    Ok(Some(info)) if nodes_healthy(&info) => return Ok(()),
                    Ok(Some(_)) => tracing::debug!("Bucket {} has unhealthy nodes", bucket),
                    Err(e @ BackendError::Authentication(_)) => return Err(e),
                    Err(e) => tracing::debug!("Bucket {} not reachable yet: {}", bucket, e),
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| BackendError::Timeout)?
    }

    async fn create_bucket(&self, bucket: &str, ram_quota_mb: u64) -> Result<(), BackendError> {
        self.mgmt_post(
            &["pools", "default", "buckets"],
            &[
                ("name", bucket.to_string()),
                ("ramQuota", ram_quota_mb.to_string()),
                ("bucketType", "couchbase".to_string()),
            ],
            &format!("bucket {}", bucket),
        )
        .await
    }

    async fn create_scope(&self, bucket: &str, scope: &str) -> Result<(), BackendError> {
        let result = self
            .mgmt_post(
                &["pools", "default", "buckets", bucket, "scopes"],
                &[("name", scope.to_string())],
                &format!("scope {}.{}", bucket, scope),
            )
            .await;
        match result {
            Err(BackendError::Storage(msg)) if msg.contains("404") => {
                Err(BackendError::BucketNotFound(bucket.to_string()))
            }
            other => other,
        }
    }

    async fn create_collection(&self, keyspace: &Keyspace) -> Result<(), BackendError> {
        self.mgmt_post(
            &[
                "pools",
                "default",
                "buckets",
                &keyspace.bucket,
                "scopes",
                &keyspace.scope,
                "collections",
            ],
            &[("name", keyspace.collection.clone())],
            &format!("collection {}", keyspace),
        )
        .await
    }

    async fn create_primary_index(&self, keyspace: &Keyspace) -> Result<(), BackendError> {
        self.run(&n1ql::create_primary_index(keyspace)).await?;
        Ok(())
    }

    async fn create_index(
        &self,
        keyspace: &Keyspace,
        name: &str,
        fields: &[String],
    ) -> Result<(), BackendError> {
        self.run(&n1ql::create_index(keyspace, name, fields)).await?;
        Ok(())
    }

    async fn create_search_index(
        &self,
        keyspace: &Keyspace,
        name: &str,
        fields: &[String],
    ) -> Result<(), BackendError> {
        let url = service_url(
            &self.endpoints.search,
            &[
                "api",
                "bucket",
                &keyspace.bucket,
                "scope",
                &keyspace.scope,
                "index",
                name,
            ],
        )?;
        let definition = search_index_definition(keyspace, name, fields);
        let (status, body) = self.send(self.client.put(url).json(&definition)).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(mgmt_error(status, &body, &format!("search index {}", name)))
    }

    async fn get(&self, keyspace: &Keyspace, key: &str) -> Result<Value, BackendError> {
        self.run(&n1ql::get(keyspace, key))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::DocumentNotFound(key.to_string()))
    }

    async fn upsert(
        &self,
        keyspace: &Keyspace,
        key: &str,
        doc: &Value,
    ) -> Result<(), BackendError> {
        self.run(&n1ql::upsert(keyspace, key, doc)).await?;
        Ok(())
    }

    async fn mutate_in(
        &self,
        keyspace: &Keyspace,
        key: &str,
        updates: &[FieldUpdate],
    ) -> Result<(), BackendError> {
        let touched = self.run(&n1ql::mutate_in(keyspace, key, updates)).await?;
        if touched.is_empty() {
            return Err(BackendError::DocumentNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn remove(&self, keyspace: &Keyspace, key: &str) -> Result<(), BackendError> {
        let removed = self.run(&n1ql::remove(keyspace, key)).await?;
        if removed.is_empty() {
            return Err(BackendError::DocumentNotFound(key.to_string()));
        }
        Ok(())
    }

    async fn query(
        &self,
        keyspace: &Keyspace,
        statement: &SelectStatement,
    ) -> Result<Vec<Value>, BackendError> {
        let stmt = n1ql::render_select(statement, keyspace)?;
        self.run(&stmt).await
    }

    async fn ping(&self, bucket: &str) -> Result<PingReport, BackendError> {
        let started = Instant::now();
        let outcome = self.bucket_info(bucket).await;
        let latency_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        let id = format!("couchbase:{}", bucket);

        match outcome {
            Ok(Some(info)) => Ok(report_from_nodes(id, &info, latency_us)),
            Ok(None) => Ok(single_failure(
                id,
                &self.endpoints.mgmt,
                PingState::Error,
                format!("bucket not found: {}", bucket),
            )),
            Err(e @ BackendError::Authentication(_)) => Err(e),
            Err(e) => {
                let state = if matches!(e, BackendError::Timeout) {
                    PingState::Timeout
                } else {
                    PingState::Error
                };
                Ok(single_failure(id, &self.endpoints.mgmt, state, e.to_string()))
            }
        }
    }
}

fn service_url(base: &str, segments: &[&str]) -> Result<Url, BackendError> {
    let mut url =
        Url::parse(base).map_err(|e| BackendError::Unavailable(format!("{}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| BackendError::Unavailable(format!("{} cannot take a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

/// Classify a failed management or search-service call.
fn mgmt_error(status: StatusCode, body: &str, what: &str) -> BackendError {
    if body.to_lowercase().contains("already exist") {
        BackendError::AlreadyExists(what.to_string())
    } else if status.is_server_error() {
        BackendError::Unavailable(format!("{}: {} {}", what, status, body))
    } else {
        BackendError::Storage(format!("{}: {} {}", what, status.as_u16(), body))
    }
}

/// Classify the first error reported by the query service.
fn query_error(issues: &[QueryIssue]) -> BackendError {
    let Some(issue) = issues.first() else {
        return BackendError::Query("unknown query error".to_string());
    };
    match issue.code {
        // Index already exists
        4300 => BackendError::AlreadyExists(issue.msg.clone()),
        // Request timeout
        1080 => BackendError::Timeout,
        // Authorisation
        10000 | 13014 => BackendError::Authentication(issue.msg.clone()),
        _ if issue.msg.to_lowercase().contains("already exist") => {
            BackendError::AlreadyExists(issue.msg.clone())
        }
        code => BackendError::Query(format!("[{}] {}", code, issue.msg)),
    }
}

fn nodes_healthy(info: &Value) -> bool {
    match info.get("nodes").and_then(Value::as_array) {
        Some(nodes) if !nodes.is_empty() => nodes
            .iter()
            .all(|n| n.get("status").and_then(Value::as_str) == Some("healthy")),
        _ => false,
    }
}

/// One endpoint per node and service, from a bucket's node list.
fn report_from_nodes(id: String, info: &Value, latency_us: u64) -> PingReport {
    let mut report = PingReport::new(id);
    let nodes = info
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for node in &nodes {
        let remote = node
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let status = node.get("status").and_then(Value::as_str).unwrap_or("unknown");
        let services = node
            .get("services")
            .and_then(Value::as_array)
            .map(|s| s.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        for service in services {
            let service = match service {
                "kv" => ServiceType::Kv,
                "n1ql" => ServiceType::Query,
                "fts" => ServiceType::Search,
                _ => continue,
            };
            let (state, error) = if status == "healthy" {
                (PingState::Ok, None)
            } else {
                (PingState::Error, Some(format!("node status {}", status)))
            };
            report.add(
                service,
                EndpointPing {
                    remote: remote.clone(),
                    state,
                    latency_us,
                    error,
                },
            );
        }
    }
    report
}

fn single_failure(id: String, remote: &str, state: PingState, error: String) -> PingReport {
    let mut report = PingReport::new(id);
    report.add(
        ServiceType::Kv,
        EndpointPing {
            remote: remote.to_string(),
            state,
            latency_us: 0,
            error: Some(error),
        },
    );
    report
}

/// Search index over `fields` of one collection.
fn search_index_definition(keyspace: &Keyspace, name: &str, fields: &[String]) -> Value {
    let properties: BTreeMap<&str, Value> = fields
        .iter()
        .map(|field| {
            (
                field.as_str(),
                json!({
                    "enabled": true,
                    "dynamic": false,
                    "fields": [{
                        "name": field,
                        "type": "text",
                        "index": true,
                        "include_in_all": true,
                    }],
                }),
            )
        })
        .collect();
    let type_name = format!("{}.{}", keyspace.scope, keyspace.collection);
    json!({
        "type": "fulltext-index",
        "name": name,
        "sourceType": "gocbcore",
        "sourceName": keyspace.bucket,
        "params": {
            "doc_config": { "mode": "scope.collection.type_field", "type_field": "type" },
            "mapping": {
                "default_mapping": { "enabled": false },
                "types": {
                    type_name: { "enabled": true, "dynamic": false, "properties": properties },
                },
            },
        },
    })
}
