//! Request-side data model shared by the translation pipeline and the HTTP layer.

use crate::time::TimeRange;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Surface language a query target is written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum QueryLanguage {
    /// Aggregation pipeline written directly as a JSON array.
    #[default]
    #[serde(rename = "json")]
    Json,
    /// `db.<collection>.aggregate(<pipeline>)` call shape.
    #[serde(rename = "javascript")]
    LegacyJs,
    /// Function expression evaluated in an isolated script runtime.
    #[serde(rename = "javascriptShadow")]
    SandboxedJs,
}

impl QueryLanguage {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryLanguage::Json => "json",
            QueryLanguage::LegacyJs => "javascript",
            QueryLanguage::SandboxedJs => "javascriptShadow",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Table,
    Timeseries,
}

/// Options forwarded to the aggregate command. Unset or non-positive numeric
/// values are not applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AggregateOptions {
    #[serde(rename = "aggregateMaxTimeMS", default)]
    pub max_time_ms: Option<i64>,
    #[serde(rename = "aggregateBatchSize", default)]
    pub batch_size: Option<i32>,
    #[serde(rename = "aggregateAllowDiskUse", default)]
    pub allow_disk_use: Option<bool>,
    #[serde(rename = "aggregateBypassDocumentValidation", default)]
    pub bypass_document_validation: Option<bool>,
    #[serde(rename = "aggregateComment", default)]
    pub comment: Option<String>,
    #[serde(rename = "aggregateMaxAwaitTime", default)]
    pub max_await_time_ms: Option<i64>,
}

/// One user-authored query unit. Immutable once received; every stage of the
/// translation derives a new value from it.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryTarget {
    pub ref_id: String,
    #[serde(default)]
    pub query_language: QueryLanguage,
    #[serde(default)]
    pub query_text: String,
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default)]
    pub query_type: QueryType,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub range: Option<TimeRange>,
    #[serde(default)]
    pub interval_ms: Option<i64>,
    /// Resolved template variables, keyed by name without the leading `$`.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(flatten)]
    pub options: AggregateOptions,
}

impl QueryTarget {
    pub fn new(ref_id: impl Into<String>, language: QueryLanguage, text: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            query_language: language,
            query_text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn with_range(mut self, from: i64, to: i64) -> Self {
        self.range = Some(TimeRange::new(from, to));
        self
    }

    pub fn with_interval(mut self, interval_ms: i64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.is_streaming = true;
        self
    }

    pub fn explicit_collection(&self) -> Option<&str> {
        self.collection
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum ConnectionScheme {
    #[default]
    #[serde(rename = "mongodb")]
    Standard,
    #[serde(rename = "mongodb+srv")]
    DnsSeedList,
}

impl ConnectionScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionScheme::Standard => "mongodb",
            ConnectionScheme::DnsSeedList => "mongodb+srv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    #[default]
    None,
    UsernamePassword,
    X509,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsOption {
    /// Driver default; explicit `tls`/`ssl` connection options are dropped.
    #[default]
    Default,
    Enabled,
    Disabled,
}

/// Persisted connection settings. Consumed only when the database
/// collaborator is built; the translation pipeline never reads them.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub scheme: ConnectionScheme,
    pub host: String,
    pub database: String,
    pub connection_options: String,
    pub auth_method: AuthMethod,
    pub username: Option<String>,
    pub password: Option<String>,
    pub auth_database: Option<String>,
    pub tls: TlsOption,
    pub ca_cert_path: Option<String>,
    pub client_cert_key_path: Option<String>,
}
