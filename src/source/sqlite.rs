//! Relational adapter over a SQLite file.
//!
//! Each call opens a fresh read-only connection and runs on the blocking
//! pool, which keeps the async workers free and gives the caller's query
//! deadline a point to fire at. The upstream file may not exist yet when
//! the monitor starts, may be swapped out underneath us, or may be briefly
//! locked by its writer; all of that should surface as a table-level error
//! on the one affected tick, not poison long-lived state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};

use super::{FieldValue, RawRecord, SourceError, TableSchema, UpstreamStore};
use crate::probe;

pub struct SqliteSource {
    path: PathBuf,
}

impl SqliteSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Run `job` against a fresh read-only connection on the blocking
    /// pool. A job the caller stops waiting for keeps its pool slot until
    /// the busy timeout lets go of it.
    async fn with_conn<T, F>(&self, job: F) -> Result<T, SourceError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, SourceError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            conn.busy_timeout(Duration::from_secs(5))?;
            job(&conn)
        })
        .await?
    }

    fn table_schema(conn: &Connection, table: &str) -> Result<TableSchema, SourceError> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quoted(table)))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(1)?, row.get::<_, i64>(5)?))
        })?;

        let mut columns = Vec::new();
        let mut primary_key = None;
        for row in rows {
            let (name, pk) = row?;
            // Composite keys number their parts from 1; the first part is
            // the scan key.
            if pk == 1 && primary_key.is_none() {
                primary_key = Some(name.clone());
            }
            columns.push(name);
        }
        if columns.is_empty() {
            return Err(SourceError::MissingTable(table.to_string()));
        }
        Ok(TableSchema {
            columns,
            primary_key,
        })
    }

    fn count_rows(conn: &Connection, table: &str) -> Result<u64, SourceError> {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quoted(table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    fn scan(
        conn: &Connection,
        table: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let schema = Self::table_schema(conn, table)?;
        let key = probe::identifier_column(&schema)
            .ok_or_else(|| SourceError::MissingTable(table.to_string()))?;

        let sql = match after {
            Some(_) => format!(
                "SELECT * FROM {t} WHERE {k} > ?1 ORDER BY {k} ASC LIMIT ?2",
                t = quoted(table),
                k = quoted(&key),
            ),
            None => format!(
                "SELECT * FROM {t} ORDER BY {k} ASC LIMIT ?1",
                t = quoted(table),
                k = quoted(&key),
            ),
        };
        let mut stmt = conn.prepare(&sql)?;
        let column_names: Vec<String> =
            stmt.column_names().iter().map(|c| c.to_string()).collect();

        // Bind the watermark numerically when it parses so integer keys
        // compare by value, not lexically.
        let mut rows = match after {
            Some(id) => match id.parse::<i64>() {
                Ok(n) => stmt.query(params![n, limit as i64])?,
                Err(_) => stmt.query(params![id, limit as i64])?,
            },
            None => stmt.query(params![limit as i64])?,
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut fields = BTreeMap::new();
            for (idx, name) in column_names.iter().enumerate() {
                fields.insert(name.clone(), field_from_ref(row.get_ref(idx)?));
            }
            // A row without a readable identifier cannot advance the
            // watermark; leave it out entirely.
            let Some(id) = fields.get(&key).and_then(id_string) else {
                continue;
            };
            records.push(RawRecord { id, fields });
        }
        Ok(records)
    }
}

#[async_trait]
impl UpstreamStore for SqliteSource {
    async fn count(&self, table: &str) -> Result<u64, SourceError> {
        let table = table.to_string();
        self.with_conn(move |conn| Self::count_rows(conn, &table))
            .await
    }

    async fn scan_after(
        &self,
        table: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RawRecord>, SourceError> {
        let table = table.to_string();
        let after = after.map(str::to_string);
        self.with_conn(move |conn| Self::scan(conn, &table, after.as_deref(), limit))
            .await
    }

    async fn schema(&self, table: &str) -> Result<TableSchema, SourceError> {
        let table = table.to_string();
        self.with_conn(move |conn| Self::table_schema(conn, &table))
            .await
    }
}

/// Double-quote an identifier for interpolation into SQL text. Bind
/// parameters cannot stand in for table or column names.
fn quoted(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn field_from_ref(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(v) => FieldValue::Integer(v),
        ValueRef::Real(v) => FieldValue::Real(v),
        ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
        // Blobs carry no duration or identifier information.
        ValueRef::Blob(_) => FieldValue::Null,
    }
}

fn id_string(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Integer(v) => Some(v.to_string()),
        FieldValue::Real(v) => Some(v.to_string()),
        FieldValue::Text(s) => Some(s.clone()),
        FieldValue::Null => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded_db(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("upstream.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE files (
                 id INTEGER PRIMARY KEY,
                 path TEXT,
                 processing_time_ms REAL
             );",
        )
        .unwrap();
        for id in 1..=5 {
            conn.execute(
                "INSERT INTO files (id, path, processing_time_ms) VALUES (?1, ?2, ?3)",
                params![id, format!("/f{id}"), id as f64 * 10.0],
            )
            .unwrap();
        }
        path
    }

    #[tokio::test]
    async fn schema_reports_columns_and_primary_key() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::new(seeded_db(&dir));

        let schema = source.schema("files").await.unwrap();
        assert_eq!(schema.columns, ["id", "path", "processing_time_ms"]);
        assert_eq!(schema.primary_key.as_deref(), Some("id"));
    }

    #[tokio::test]
    async fn missing_table_is_a_distinct_error() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::new(seeded_db(&dir));

        let err = source.schema("nope").await.unwrap_err();
        assert!(matches!(err, SourceError::MissingTable(t) if t == "nope"));
    }

    #[tokio::test]
    async fn missing_file_fails_per_call() {
        let source = SqliteSource::new("/definitely/not/here.sqlite");
        assert!(source.count("files").await.is_err());
    }

    #[tokio::test]
    async fn scan_after_is_ascending_exclusive_and_limited() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::new(seeded_db(&dir));

        let all = source.scan_after("files", None, 100).await.unwrap();
        assert_eq!(
            all.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            ["1", "2", "3", "4", "5"]
        );

        let tail = source.scan_after("files", Some("2"), 2).await.unwrap();
        assert_eq!(
            tail.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            ["3", "4"]
        );
        assert_eq!(
            tail[0].field("processing_time_ms"),
            Some(&FieldValue::Real(30.0))
        );
    }

    #[tokio::test]
    async fn count_sees_every_row() {
        let dir = TempDir::new().unwrap();
        let source = SqliteSource::new(seeded_db(&dir));
        assert_eq!(source.count("files").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn a_locked_database_yields_to_the_caller_deadline() {
        let dir = TempDir::new().unwrap();
        let path = seeded_db(&dir);
        // An exclusive transaction stalls every reader on the busy
        // handler; the caller's deadline must still be able to fire.
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let source = SqliteSource::new(&path);
        let scan = source.scan_after("files", None, 10);
        let result = tokio::time::timeout(Duration::ZERO, scan).await;
        assert!(result.is_err());

        blocker.execute_batch("COMMIT;").unwrap();
    }

    #[tokio::test]
    async fn text_keys_scan_lexically() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("text.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE jobs (name TEXT PRIMARY KEY, duration_ms REAL);
             INSERT INTO jobs VALUES ('alpha', 1.0), ('beta', 2.0), ('gamma', 3.0);",
        )
        .unwrap();

        let source = SqliteSource::new(&path);
        let tail = source.scan_after("jobs", Some("alpha"), 10).await.unwrap();
        assert_eq!(
            tail.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            ["beta", "gamma"]
        );
    }
}
