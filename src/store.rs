//! The monitor's own durable state: watermarks, per-tick samples, the
//! archived duration series, and fit history. One SQLite file in WAL mode
//! so the HTTP read surface never blocks the sampler's writes.
//!
//! Single-writer by contract: exactly one sampler instance may own a store
//! file. Pointing two instances at the same file is unsupported and will
//! interleave watermark advances.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, Row};
use serde::Serialize;

use crate::error::Result;
use crate::trend::{self, Fit, FitKind, Trend};

// ─── Row types ───────────────────────────────────────────────────

/// One per-table snapshot per tick. The summary fields are null when the
/// tick observed no usable durations.
#[derive(Debug, Clone, Serialize)]
pub struct SampleRow {
    pub ts_utc: String,
    pub table_name: String,
    pub total_count: i64,
    pub new_count: i64,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FitRow {
    pub ts_utc: String,
    pub table_name: String,
    pub kind: String,
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub sample_count: i64,
}

/// Newest stored fit of each kind for one table.
#[derive(Debug, Clone, Serialize)]
pub struct LatestFits {
    pub linear: Option<FitRow>,
    pub exponential: Option<FitRow>,
}

impl LatestFits {
    /// Model selection over whatever is stored.
    pub fn classify(&self) -> Trend {
        trend::classify(
            self.linear.as_ref().map(|f| (f.slope, f.r_squared)),
            self.exponential.as_ref().map(|f| (f.slope, f.r_squared)),
        )
    }
}

pub struct MonitorStore {
    conn: Connection,
}

impl MonitorStore {
    /// Open the store at `path`, creating the file, its parent directory
    /// and the schema as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Read-only handle for the HTTP surface and the exporter.
    pub fn open_readonly(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self { conn })
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS samples (
                 ts_utc      TEXT NOT NULL,
                 table_name  TEXT NOT NULL,
                 total_count INTEGER NOT NULL,
                 new_count   INTEGER NOT NULL,
                 mean_ms     REAL,
                 p50_ms      REAL,
                 p95_ms      REAL
             );
             CREATE INDEX IF NOT EXISTS idx_samples_table_ts
                 ON samples (table_name, ts_utc);

             CREATE TABLE IF NOT EXISTS watermarks (
                 table_name   TEXT PRIMARY KEY,
                 last_seen_id TEXT NOT NULL,
                 last_seen_ts TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS durations (
                 ts_utc      TEXT NOT NULL,
                 table_name  TEXT NOT NULL,
                 record_id   TEXT NOT NULL,
                 duration_ms REAL
             );
             CREATE INDEX IF NOT EXISTS idx_durations_table
                 ON durations (table_name);

             CREATE TABLE IF NOT EXISTS fits (
                 ts_utc       TEXT NOT NULL,
                 table_name   TEXT NOT NULL,
                 kind         TEXT NOT NULL,
                 slope        REAL NOT NULL,
                 intercept    REAL NOT NULL,
                 r_squared    REAL NOT NULL,
                 sample_count INTEGER NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_fits_table_kind_ts
                 ON fits (table_name, kind, ts_utc);",
        )?;
        Ok(Self { conn })
    }

    // ─── Watermarks ──────────────────────────────────────────────

    /// Resume point for `table`, if any scan has ever completed.
    pub fn watermark(&self, table: &str) -> Result<Option<String>> {
        match self.conn.query_row(
            "SELECT last_seen_id FROM watermarks WHERE table_name = ?1",
            params![table],
            |row| row.get(0),
        ) {
            Ok(id) => Ok(Some(id)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert the watermark. Monotonicity is the caller's job: the sampler
    /// always passes the highest identifier in the batch, and the store
    /// overwrites unconditionally. Re-running with the same id is a no-op
    /// in effect, which is what makes a crashed tick safe to repeat.
    pub fn advance_watermark(&self, table: &str, last_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO watermarks (table_name, last_seen_id, last_seen_ts)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(table_name) DO UPDATE SET
                 last_seen_id = excluded.last_seen_id,
                 last_seen_ts = excluded.last_seen_ts",
            params![table, last_id, ts_string(now)],
        )?;
        Ok(())
    }

    // ─── Samples and durations ───────────────────────────────────

    /// Append one sample row and archive the batch's raw observations in
    /// the same transaction. `observations` holds every scanned record,
    /// including the ones whose duration is unknown.
    pub fn record_sample(
        &self,
        table: &str,
        total_count: u64,
        observations: &[(String, Option<f64>)],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let durations: Vec<f64> = observations.iter().filter_map(|(_, d)| *d).collect();
        let summary = trend::summarize(&durations);
        let ts = ts_string(now);

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO samples
                 (ts_utc, table_name, total_count, new_count, mean_ms, p50_ms, p95_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts,
                table,
                total_count as i64,
                observations.len() as i64,
                summary.mean_ms,
                summary.p50_ms,
                summary.p95_ms
            ],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO durations (ts_utc, table_name, record_id, duration_ms)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (record_id, duration_ms) in observations {
                stmt.execute(params![ts, table, record_id, duration_ms])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Archived durations with a known value for `table`, in arrival
    /// order. This is the y-series the fitter runs over.
    pub fn duration_series(&self, table: &str) -> Result<Vec<f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT duration_ms FROM durations
             WHERE table_name = ?1 AND duration_ms IS NOT NULL
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![table], |row| row.get(0))?;
        let mut series = Vec::new();
        for value in rows {
            series.push(value?);
        }
        Ok(series)
    }

    // ─── Fits ────────────────────────────────────────────────────

    pub fn append_fit(&self, table: &str, fit: &Fit, now: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO fits
                 (ts_utc, table_name, kind, slope, intercept, r_squared, sample_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                ts_string(now),
                table,
                fit.kind.as_str(),
                fit.slope,
                fit.intercept,
                fit.r_squared,
                fit.n as i64
            ],
        )?;
        Ok(())
    }

    /// Full fit history, newest first.
    pub fn fits_all(&self) -> Result<Vec<FitRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts_utc, table_name, kind, slope, intercept, r_squared, sample_count
             FROM fits ORDER BY ts_utc DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([], fit_from_row)?;
        collect(rows)
    }

    pub fn latest_fits(&self, table: &str) -> Result<LatestFits> {
        Ok(LatestFits {
            linear: self.latest_fit(table, FitKind::Linear)?,
            exponential: self.latest_fit(table, FitKind::Exponential)?,
        })
    }

    fn latest_fit(&self, table: &str, kind: FitKind) -> Result<Option<FitRow>> {
        match self.conn.query_row(
            "SELECT ts_utc, table_name, kind, slope, intercept, r_squared, sample_count
             FROM fits WHERE table_name = ?1 AND kind = ?2
             ORDER BY ts_utc DESC, rowid DESC LIMIT 1",
            params![table, kind.as_str()],
            fit_from_row,
        ) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // ─── Read surface ────────────────────────────────────────────

    /// Samples ascending by time, optionally for one table, optionally
    /// trimmed to the newest `limit` rows (still returned ascending).
    pub fn samples(&self, table: Option<&str>, limit: Option<usize>) -> Result<Vec<SampleRow>> {
        // LIMIT -1 means unlimited to SQLite.
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let mut rows = match table {
            Some(t) => {
                let mut stmt = self.conn.prepare(
                    "SELECT ts_utc, table_name, total_count, new_count, mean_ms, p50_ms, p95_ms
                     FROM samples WHERE table_name = ?1
                     ORDER BY ts_utc DESC, rowid DESC LIMIT ?2",
                )?;
                let mapped = stmt.query_map(params![t, limit], sample_from_row)?;
                collect(mapped)?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT ts_utc, table_name, total_count, new_count, mean_ms, p50_ms, p95_ms
                     FROM samples ORDER BY ts_utc DESC, rowid DESC LIMIT ?1",
                )?;
                let mapped = stmt.query_map(params![limit], sample_from_row)?;
                collect(mapped)?
            }
        };
        rows.reverse();
        Ok(rows)
    }

    /// First rows ever recorded, for the CSV head artifact.
    pub fn samples_head(&self, limit: usize) -> Result<Vec<SampleRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts_utc, table_name, total_count, new_count, mean_ms, p50_ms, p95_ms
             FROM samples ORDER BY rowid ASC LIMIT ?1",
        )?;
        let mapped = stmt.query_map(params![limit as i64], sample_from_row)?;
        collect(mapped)
    }

    pub fn latest_sample(&self, table: &str) -> Result<Option<SampleRow>> {
        match self.conn.query_row(
            "SELECT ts_utc, table_name, total_count, new_count, mean_ms, p50_ms, p95_ms
             FROM samples WHERE table_name = ?1
             ORDER BY ts_utc DESC, rowid DESC LIMIT 1",
            params![table],
            sample_from_row,
        ) {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stored timestamp format; lexicographic order matches time order.
fn ts_string(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<SampleRow> {
    Ok(SampleRow {
        ts_utc: row.get(0)?,
        table_name: row.get(1)?,
        total_count: row.get(2)?,
        new_count: row.get(3)?,
        mean_ms: row.get(4)?,
        p50_ms: row.get(5)?,
        p95_ms: row.get(6)?,
    })
}

fn fit_from_row(row: &Row<'_>) -> rusqlite::Result<FitRow> {
    Ok(FitRow {
        ts_utc: row.get(0)?,
        table_name: row.get(1)?,
        kind: row.get(2)?,
        slope: row.get(3)?,
        intercept: row.get(4)?,
        r_squared: row.get(5)?,
        sample_count: row.get(6)?,
    })
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> MonitorStore {
        MonitorStore::open(dir.path().join("monitor.sqlite")).unwrap()
    }

    fn at(second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 23, 12, 0, second).unwrap()
    }

    #[test]
    fn watermark_starts_absent_and_upserts() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        assert_eq!(store.watermark("files").unwrap(), None);

        store.advance_watermark("files", "17", at(0)).unwrap();
        assert_eq!(store.watermark("files").unwrap().as_deref(), Some("17"));

        // Same id again: no change, no error.
        store.advance_watermark("files", "17", at(1)).unwrap();
        assert_eq!(store.watermark("files").unwrap().as_deref(), Some("17"));

        store.advance_watermark("files", "42", at(2)).unwrap();
        assert_eq!(store.watermark("files").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn record_sample_computes_the_summary() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let observations = vec![
            ("1".to_string(), Some(10.0)),
            ("2".to_string(), Some(20.0)),
            ("3".to_string(), None),
        ];
        store.record_sample("files", 7, &observations, at(0)).unwrap();

        let rows = store.samples(Some("files"), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_count, 7);
        assert_eq!(rows[0].new_count, 3);
        assert!((rows[0].mean_ms.unwrap() - 15.0).abs() < 1e-9);
        assert!((rows[0].p50_ms.unwrap() - 15.0).abs() < 1e-9);
        assert!((rows[0].p95_ms.unwrap() - 19.5).abs() < 1e-9);
    }

    #[test]
    fn empty_batches_record_null_summaries() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store.record_sample("files", 9, &[], at(0)).unwrap();

        let rows = store.samples(Some("files"), None).unwrap();
        assert_eq!(rows[0].new_count, 0);
        assert_eq!(rows[0].total_count, 9);
        assert!(rows[0].mean_ms.is_none());
        assert!(rows[0].p50_ms.is_none());
        assert!(rows[0].p95_ms.is_none());
    }

    #[test]
    fn duration_series_keeps_order_and_drops_unknowns() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        store
            .record_sample(
                "files",
                2,
                &[("1".into(), Some(5.0)), ("2".into(), None)],
                at(0),
            )
            .unwrap();
        store
            .record_sample(
                "files",
                4,
                &[("3".into(), Some(7.0)), ("4".into(), Some(6.0))],
                at(1),
            )
            .unwrap();
        store
            .record_sample("chunks", 1, &[("1".into(), Some(99.0))], at(1))
            .unwrap();

        assert_eq!(store.duration_series("files").unwrap(), [5.0, 7.0, 6.0]);
        assert_eq!(store.duration_series("chunks").unwrap(), [99.0]);
    }

    #[test]
    fn latest_fits_pick_the_newest_of_each_kind() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        let older = Fit {
            kind: FitKind::Linear,
            slope: 1.0,
            intercept: 0.0,
            r_squared: 0.9,
            n: 10,
        };
        let newer = Fit {
            slope: 2.0,
            ..older.clone()
        };
        store.append_fit("files", &older, at(0)).unwrap();
        store.append_fit("files", &newer, at(5)).unwrap();

        let latest = store.latest_fits("files").unwrap();
        assert_eq!(latest.linear.as_ref().unwrap().slope, 2.0);
        assert!(latest.exponential.is_none());

        let history = store.fits_all().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].slope, 2.0);
    }

    #[test]
    fn sample_limit_keeps_the_newest_rows_ascending() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);

        for second in 0..3 {
            store
                .record_sample("files", second as u64, &[], at(second))
                .unwrap();
        }

        let rows = store.samples(Some("files"), Some(2)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].total_count, 1);
        assert_eq!(rows[1].total_count, 2);
        assert!(rows[0].ts_utc < rows[1].ts_utc);
    }
}
