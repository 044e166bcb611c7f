//! Configuration for shoplist-store
//!
//! Connection credentials and topology settings. Values come from the
//! environment (the variable names the deployment already uses), from TOML,
//! or from JSON.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fields that receive a secondary index and may be filtered or sorted on.
pub const DEFAULT_INDEXED_FIELDS: &[&str] = &[
    "title", "amount", "unit", "bought", "shop", "created", "updated",
];

/// Fields covered by the full-text search index.
pub const DEFAULT_SEARCH_FIELDS: &[&str] = &["title", "shop", "unit", "description"];

/// Cluster credentials and bucket settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub connection_string: String,
    pub bucket: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Memory quota used when the bucket has to be created
    #[serde(default = "default_ram_quota_mb")]
    pub ram_quota_mb: u64,
}

fn default_ram_quota_mb() -> u64 {
    200
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_string: "sqlite::memory:".to_string(),
            bucket: "shoppinglist".to_string(),
            username: String::new(),
            password: String::new(),
            ram_quota_mb: default_ram_quota_mb(),
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connection_string", &self.connection_string)
            .field("bucket", &self.bucket)
            .field("username", &self.username)
            .field("has_password", &!self.password.is_empty())
            .field("ram_quota_mb", &self.ram_quota_mb)
            .finish()
    }
}

/// Store-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub connection: ConnectionConfig,
    /// Scope holding the collection
    #[serde(default = "default_scope")]
    pub scope: String,
    /// Collection holding item documents; `None` gives a ping-only handle
    #[serde(default = "default_collection")]
    pub collection: Option<String>,
    #[serde(default = "default_indexed_fields")]
    pub indexed_fields: Vec<String>,
    #[serde(default = "default_search_fields")]
    pub search_fields: Vec<String>,
    #[serde(default = "default_search_index")]
    pub search_index: String,
    /// How long to wait for the bucket before trying to create it
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    /// Deadline covering the paired list and count statements
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
}

fn default_scope() -> String {
    "0".to_string()
}

fn default_collection() -> Option<String> {
    Some("items".to_string())
}

fn default_indexed_fields() -> Vec<String> {
    DEFAULT_INDEXED_FIELDS.iter().map(|s| s.to_string()).collect()
}

fn default_search_fields() -> Vec<String> {
    DEFAULT_SEARCH_FIELDS.iter().map(|s| s.to_string()).collect()
}

fn default_search_index() -> String {
    "items-search".to_string()
}

fn default_ready_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            scope: default_scope(),
            collection: default_collection(),
            indexed_fields: default_indexed_fields(),
            search_fields: default_search_fields(),
            search_index: default_search_index(),
            ready_timeout_ms: default_ready_timeout_ms(),
            query_timeout_ms: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for an embedded in-memory engine
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Same settings without a collection, for health checks only
    pub fn without_collection(mut self) -> Self {
        self.collection = None;
        self
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    /// Build from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("COUCHBASE_CONNECTION_STRING") {
            config.connection.connection_string = v;
        }
        if let Some(v) = lookup("COUCHBASE_BUCKET") {
            config.connection.bucket = v;
        }
        if let Some(v) = lookup("COUCHBASE_USERNAME") {
            config.connection.username = v;
        }
        if let Some(v) = lookup("COUCHBASE_PASSWORD") {
            config.connection.password = v;
        }
        if let Some(v) = lookup("COUCHBASE_RAM_QUOTA_MB") {
            config.connection.ram_quota_mb = parse_number("COUCHBASE_RAM_QUOTA_MB", &v)?;
        }
        if let Some(v) = lookup("SHOPLIST_COLLECTION") {
            config.collection = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = lookup("SHOPLIST_READY_TIMEOUT_MS") {
            config.ready_timeout_ms = parse_number("SHOPLIST_READY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("SHOPLIST_QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = Some(parse_number("SHOPLIST_QUERY_TIMEOUT_MS", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection.connection_string.trim().is_empty() {
            return Err(ConfigError::MissingField("connection_string".to_string()));
        }
        if self.connection.bucket.trim().is_empty() {
            return Err(ConfigError::MissingField("bucket".to_string()));
        }
        if self.scope.trim().is_empty() {
            return Err(ConfigError::MissingField("scope".to_string()));
        }
        if let Some(collection) = &self.collection {
            if collection.trim().is_empty() {
                return Err(ConfigError::MissingField("collection".to_string()));
            }
        }
        if self.connection.ram_quota_mb == 0 {
            return Err(ConfigError::OutOfRange(
                "ram_quota_mb must be positive".to_string(),
            ));
        }
        if self.ready_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange(
                "ready_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::OutOfRange(format!("{} is not a number: {:?}", key, value)))
}

/// Configuration validation error
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Required field is missing or blank
    #[error("Missing field: {0}")]
    MissingField(String),
    /// Value is out of valid range
    #[error("Value out of range: {0}")]
    OutOfRange(String),
    /// Document could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),
}
