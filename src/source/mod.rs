//! Upstream table access.
//!
//! The sampler needs exactly four primitives from whatever store it
//! watches: a total count, an ordered scan past an identifier, a bounded
//! head scan, and column introspection. Both adapters (relational SQLite,
//! document-style Redis) implement those and nothing more, which keeps the
//! loop backend-agnostic.

pub mod redis;
pub mod sqlite;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::redis::RedisSource;
pub use self::sqlite::SqliteSource;

// ─── Records ─────────────────────────────────────────────────────

/// One field value as observed upstream. Mirrors the loosely typed reality
/// of both backends: SQLite hands back typed values, Redis hands back
/// strings that may or may not be numeric.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl FieldValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(v) => Some(*v as f64),
            FieldValue::Real(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse().ok(),
            FieldValue::Null => None,
        }
    }

    /// JSON rendering for head dumps. Non-finite reals become null rather
    /// than invalid JSON.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Integer(v) => serde_json::Value::from(*v),
            FieldValue::Real(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            FieldValue::Text(s) => serde_json::Value::from(s.as_str()),
        }
    }
}

/// A record as scanned upstream: its identifier in the store's native
/// ordering plus an opaque field map.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: String,
    pub fields: BTreeMap<String, FieldValue>,
}

impl RawRecord {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }
}

/// Column set of an upstream table, as reported by the backend.
#[derive(Debug, Clone, Default)]
pub struct TableSchema {
    /// Column names in declaration (or sampled) order.
    pub columns: Vec<String>,
    /// Declared primary key, when the backend knows one.
    pub primary_key: Option<String>,
}

// ─── Errors ──────────────────────────────────────────────────────

/// Table-level upstream failure. Never fatal: the sampler records a
/// zero-valued sample for the affected table and moves on.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("query: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("redis: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("query timed out after {0:?}")]
    Timeout(Duration),

    #[error("table '{0}' does not exist")]
    MissingTable(String),

    /// The stored watermark cannot be positioned in the backend's native
    /// ordering. Surfaced rather than rescanning from the start.
    #[error("watermark '{0}' is not numeric")]
    BadWatermark(String),

    #[error("query worker: {0}")]
    Task(#[from] tokio::task::JoinError),
}

// ─── The four primitives ─────────────────────────────────────────

#[async_trait]
pub trait UpstreamStore: Send + Sync {
    /// Total record count for `table`.
    async fn count(&self, table: &str) -> Result<u64, SourceError>;

    /// Records with identifier strictly greater than `after` (all records
    /// when `after` is `None`), ascending, at most `limit` of them.
    async fn scan_after(
        &self,
        table: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError>;

    /// Column names plus primary-key metadata.
    async fn schema(&self, table: &str) -> Result<TableSchema, SourceError>;

    /// First `limit` records by identifier, for head dumps.
    async fn head(&self, table: &str, limit: usize) -> Result<Vec<RawRecord>, SourceError> {
        self.scan_after(table, None, limit).await
    }
}

// ─── URL dispatch ────────────────────────────────────────────────

/// `redis://`-style URLs go to the document adapter.
pub fn is_redis_url(url: &str) -> bool {
    url.starts_with("redis://") || url.starts_with("rediss://")
}

/// Everything else is a SQLite file path with an optional scheme prefix.
pub fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://").unwrap_or(url)
}
