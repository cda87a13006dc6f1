//! Document-style adapter over Redis.
//!
//! Key layout per table: one hash per record at `<table>:<id>` and a
//! sorted-set index at `<table>:index` scoring each id by its numeric
//! value. Incremental scans are then a single ZRANGEBYSCORE past the
//! watermark, and the native ordering stays numeric and monotone.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{FieldValue, RawRecord, SourceError, TableSchema, UpstreamStore};

pub struct RedisSource {
    conn: ConnectionManager,
}

impl RedisSource {
    /// `ConnectionManager` re-establishes dropped connections on its own,
    /// which is all the bootstrap this adapter needs.
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Shared handle for the demo seeder.
    pub fn connection(&self) -> &ConnectionManager {
        &self.conn
    }

    pub fn index_key(table: &str) -> String {
        format!("{table}:index")
    }

    pub fn record_key(table: &str, id: &str) -> String {
        format!("{table}:{id}")
    }
}

#[async_trait]
impl UpstreamStore for RedisSource {
    async fn count(&self, table: &str) -> Result<u64, SourceError> {
        let mut conn = self.conn.clone();
        let n: u64 = conn.zcard(Self::index_key(table)).await?;
        Ok(n)
    }

    async fn scan_after(
        &self,
        table: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let mut conn = self.conn.clone();

        let min = score_range_min(after)?;
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(Self::index_key(table))
            .arg(&min)
            .arg("+inf")
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        // One pipelined round trip for the whole batch of hashes.
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HGETALL").arg(Self::record_key(table, id));
        }
        let maps: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, map) in ids.into_iter().zip(maps) {
            if map.is_empty() {
                // Index entry whose hash is gone; nothing to extract.
                continue;
            }
            let fields: BTreeMap<String, FieldValue> = map
                .into_iter()
                .map(|(name, value)| (name, parse_field(&value)))
                .collect();
            records.push(RawRecord { id, fields });
        }
        Ok(records)
    }

    async fn schema(&self, table: &str) -> Result<TableSchema, SourceError> {
        let mut conn = self.conn.clone();
        let first: Vec<String> = conn.zrange(Self::index_key(table), 0, 0).await?;
        let Some(id) = first.first() else {
            // Empty and unknown collections are indistinguishable here:
            // both probe to no fields and still count as zero.
            return Ok(TableSchema::default());
        };

        let map: HashMap<String, String> = conn.hgetall(Self::record_key(table, id)).await?;
        let mut columns: Vec<String> = map.into_keys().collect();
        columns.sort();
        let primary_key = columns
            .iter()
            .any(|c| c == "id")
            .then(|| "id".to_string());
        Ok(TableSchema {
            columns,
            primary_key,
        })
    }
}

/// Exclusive ZRANGEBYSCORE lower bound for a scan past `after`. The index
/// scores are numeric ids, so a watermark that does not parse as one
/// cannot be positioned; that is an error, never a rescan from `-inf`.
fn score_range_min(after: Option<&str>) -> Result<String, SourceError> {
    match after {
        None => Ok("-inf".to_string()),
        Some(id) => match id.parse::<u64>() {
            Ok(n) => Ok(format!("({n}")),
            Err(_) => Err(SourceError::BadWatermark(id.to_string())),
        },
    }
}

/// Redis hashes store strings; recover numbers where they parse.
fn parse_field(raw: &str) -> FieldValue {
    if let Ok(v) = raw.parse::<i64>() {
        return FieldValue::Integer(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return FieldValue::Real(v);
    }
    FieldValue::Text(raw.to_string())
}
