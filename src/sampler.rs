//! The sampler loop: one long-lived task, one tick per interval, one pass
//! over every tracked table per tick.
//!
//! Failure containment is the whole game. An upstream error anywhere in a
//! table's scan records a zero-valued fallback sample for that table and
//! moves on, so the series stays gap-free and other tables are untouched.
//! Only a local-store error escapes the loop, and that one is fatal: the
//! process must not keep scanning without durable watermarks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{Config, NegativeDurations};
use crate::error::MonitorError;
use crate::exporter;
use crate::extract;
use crate::health::SamplerHealth;
use crate::probe::{self, CapabilityProfile};
use crate::source::{SourceError, UpstreamStore};
use crate::store::MonitorStore;
use crate::trend;

pub struct Sampler {
    store: MonitorStore,
    source: Arc<dyn UpstreamStore>,
    health: Arc<SamplerHealth>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    export_running: Arc<AtomicBool>,
    cfg: Arc<Config>,
    /// Probed per table on first contact, dropped again after a failure so
    /// the next tick re-probes a possibly changed schema.
    profiles: HashMap<String, CapabilityProfile>,
    ticks: u64,
}

impl Sampler {
    pub fn new(
        store: MonitorStore,
        source: Arc<dyn UpstreamStore>,
        health: Arc<SamplerHealth>,
        running: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        export_running: Arc<AtomicBool>,
        cfg: Arc<Config>,
    ) -> Self {
        Self {
            store,
            source,
            health,
            running,
            shutdown,
            export_running,
            cfg,
            profiles: HashMap::new(),
            ticks: 0,
        }
    }

    /// Run until shutdown. Ticks are driven by a drift-corrected interval;
    /// shutdown is observed between ticks, never mid-table.
    pub async fn run(mut self) -> Result<(), MonitorError> {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
        // An overrunning tick skips to the next boundary instead of
        // bursting; whatever it missed is picked up by the watermark scan.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            tables = ?self.cfg.tables,
            interval_secs = self.cfg.interval_secs,
            "sampler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.notified() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.tick_once().await?;
        }

        info!(ticks = self.ticks, "sampler stopped");
        Ok(())
    }

    /// One tick: every tracked table in turn, then the status poll, then
    /// possibly an export. Crate-visible so scenario tests can drive the
    /// loop without the timer.
    pub(crate) async fn tick_once(&mut self) -> Result<(), MonitorError> {
        let tick_started = Instant::now();

        let tables = self.cfg.tables.clone();
        for table in &tables {
            self.sample_table(table).await?;
        }

        self.poll_status_count().await;

        self.ticks += 1;
        if self.cfg.export_every > 0 && self.ticks % self.cfg.export_every == 0 {
            self.run_export().await;
        }

        self.health.tick_done(tick_started.elapsed(), Utc::now());
        Ok(())
    }

    /// One table's pass: fetch watermark, scan past it, extract durations,
    /// advance the watermark, count, record, refit. Upstream failures are
    /// absorbed here; whatever escapes is a local-store error.
    async fn sample_table(&mut self, table: &str) -> Result<(), MonitorError> {
        let now = Utc::now();
        let watermark = self.store.watermark(table)?;

        match self.scan_new(table, watermark.as_deref()).await {
            Ok((observations, convention)) => {
                // Advance only when the scan saw something; the highest
                // identifier is the last one since scans are ascending.
                if let Some((last_id, _)) = observations.last() {
                    self.store.advance_watermark(table, last_id, now)?;
                }

                let total = self.count_total(table).await;
                self.store.record_sample(table, total, &observations, now)?;

                let series = self.store.duration_series(table)?;
                if !series.is_empty() {
                    let (linear, exponential) = trend::fit_series(&series);
                    for fit in [linear, exponential].into_iter().flatten() {
                        self.store.append_fit(table, &fit, now)?;
                    }
                }

                debug!(table, new = observations.len(), total, "table sampled");
                self.health
                    .table_ok(table, total, observations.len(), convention, now);
            }
            Err(err) => {
                warn!(table, error = %err, "scan failed; recording fallback sample");
                // The profile may be stale; re-probe on the next tick.
                self.profiles.remove(table);

                let total = self.count_total(table).await;
                self.store.record_sample(table, total, &[], now)?;
                self.health.table_failed(table, &err.to_string(), total);
            }
        }
        Ok(())
    }

    /// Probe (or reuse the cached profile), scan past the watermark, and
    /// turn the batch into `(record id, optional duration)` observations.
    async fn scan_new(
        &mut self,
        table: &str,
        after: Option<&str>,
    ) -> Result<(Vec<(String, Option<f64>)>, &'static str), SourceError> {
        let profile = match self.profiles.get(table) {
            Some(profile) => profile.clone(),
            None => {
                let schema = with_timeout(self.query_timeout(), self.source.schema(table)).await?;
                let profile = probe::profile_from_schema(&schema);
                info!(
                    table,
                    id_column = %profile.id_column,
                    convention = profile.convention.name(),
                    "table probed"
                );
                // A table with no records reports no columns. Leave that
                // probe uncached so the first real records get a fresh one.
                if !schema.columns.is_empty() {
                    self.profiles.insert(table.to_string(), profile.clone());
                }
                profile
            }
        };

        let batch = with_timeout(
            self.query_timeout(),
            self.source.scan_after(table, after, self.cfg.batch_limit),
        )
        .await?;

        let policy = self.cfg.negative_durations;
        let observations = batch
            .iter()
            .map(|record| {
                let duration = extract::extract(record, &profile)
                    .and_then(|ms| apply_negative_policy(policy, ms));
                (record.id.clone(), duration)
            })
            .collect();

        Ok((observations, profile.convention.name()))
    }

    /// The total count is display-only and deliberately decoupled from the
    /// scan: when it fails the tick still proceeds with zero.
    async fn count_total(&mut self, table: &str) -> u64 {
        match with_timeout(self.query_timeout(), self.source.count(table)).await {
            Ok(n) => n,
            Err(err) => {
                debug!(table, error = %err, "total count unavailable");
                0
            }
        }
    }

    /// Best-effort gauge of the auxiliary status stream.
    async fn poll_status_count(&mut self) {
        let Some(status_table) = self.cfg.status_source() else {
            return;
        };
        match with_timeout(self.query_timeout(), self.source.count(status_table)).await {
            Ok(n) => self.health.status_count(n),
            Err(err) => debug!(table = status_table, error = %err, "status poll failed"),
        }
    }

    async fn run_export(&mut self) {
        if self.export_running.swap(true, Ordering::SeqCst) {
            debug!("export already in progress; skipping cadence run");
            return;
        }
        match exporter::export_all(&self.cfg, self.source.as_ref()).await {
            Ok(artifacts) => {
                self.health.export_done();
                info!(artifacts = artifacts.len(), "export complete");
            }
            Err(err) => warn!(error = %err, "export failed"),
        }
        self.export_running.store(false, Ordering::SeqCst);
    }

    fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.query_timeout_secs)
    }
}

/// A hung upstream query is a table-level failure, not a wedged loop.
/// Free of `self` so the spawned sampler future stays `Send`.
async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, SourceError>>,
) -> Result<T, SourceError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(limit)),
    }
}

/// Negative durations get the configured treatment before archival.
fn apply_negative_policy(policy: NegativeDurations, ms: f64) -> Option<f64> {
    if ms >= 0.0 {
        return Some(ms);
    }
    match policy {
        NegativeDurations::Keep => Some(ms),
        NegativeDurations::Discard => None,
        NegativeDurations::Clamp => Some(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FieldValue, RawRecord, SqliteSource, TableSchema};
    use rusqlite::{params, Connection};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn test_cfg(dir: &TempDir, tables: &[&str]) -> Config {
        Config {
            source_url: String::new(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
            status_table: String::new(),
            interval_secs: 1,
            store_path: dir.path().join("monitor.sqlite"),
            export_dir: dir.path().join("exports"),
            head_limit: 10,
            export_every: 0,
            batch_limit: 10_000,
            query_timeout_secs: 5,
            negative_durations: NegativeDurations::Keep,
            listen: String::new(),
            seed_demo: false,
        }
    }

    fn sampler_with(cfg: Config, upstream: &Path) -> Sampler {
        let store = MonitorStore::open(&cfg.store_path).unwrap();
        Sampler::new(
            store,
            Arc::new(SqliteSource::new(upstream)),
            Arc::new(SamplerHealth::new()),
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
            Arc::new(AtomicBool::new(false)),
            Arc::new(cfg),
        )
    }

    fn files_upstream(dir: &TempDir, rows: usize) -> PathBuf {
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
        for id in 1..=rows {
            conn.execute(
                "INSERT INTO files (id, path, processing_time_ms) VALUES (?1, ?2, ?3)",
                params![id as i64, format!("/f{id}"), id as f64 * 10.0],
            )
            .unwrap();
        }
        path
    }

    /// Document-style store double: like the hash adapter, an empty
    /// collection has no fields to report, so its schema comes back blank.
    #[derive(Default)]
    struct MemoryDocs {
        rows: parking_lot::Mutex<Vec<(u64, f64)>>,
    }

    impl MemoryDocs {
        fn push(&self, id: u64, ms: f64) {
            self.rows.lock().push((id, ms));
        }
    }

    #[async_trait::async_trait]
    impl UpstreamStore for MemoryDocs {
        async fn count(&self, _table: &str) -> Result<u64, SourceError> {
            Ok(self.rows.lock().len() as u64)
        }

        async fn scan_after(
            &self,
            _table: &str,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<RawRecord>, SourceError> {
            let floor: u64 = after.and_then(|a| a.parse().ok()).unwrap_or(0);
            let rows = self.rows.lock();
            Ok(rows
                .iter()
                .filter(|(id, _)| *id > floor)
                .take(limit)
                .map(|(id, ms)| RawRecord {
                    id: id.to_string(),
                    fields: [
                        ("id".to_string(), FieldValue::Integer(*id as i64)),
                        ("processing_time_ms".to_string(), FieldValue::Real(*ms)),
                    ]
                    .into_iter()
                    .collect(),
                })
                .collect())
        }

        async fn schema(&self, _table: &str) -> Result<TableSchema, SourceError> {
            if self.rows.lock().is_empty() {
                return Ok(TableSchema::default());
            }
            Ok(TableSchema {
                columns: vec!["id".to_string(), "processing_time_ms".to_string()],
                primary_key: Some("id".to_string()),
            })
        }
    }

    fn doc_sampler(cfg: Config, docs: Arc<MemoryDocs>) -> Sampler {
        let store = MonitorStore::open(&cfg.store_path).unwrap();
        Sampler::new(
            store,
            docs,
            Arc::new(SamplerHealth::new()),
            Arc::new(AtomicBool::new(true)),
            Arc::new(Notify::new()),
            Arc::new(AtomicBool::new(false)),
            Arc::new(cfg),
        )
    }

    #[tokio::test]
    async fn first_poll_scans_everything_second_poll_nothing() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 5);
        let mut sampler = sampler_with(test_cfg(&dir, &["files"]), &upstream);

        sampler.tick_once().await.unwrap();

        let rows = sampler.store.samples(Some("files"), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].new_count, 5);
        assert_eq!(rows[0].total_count, 5);
        assert!((rows[0].mean_ms.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(
            sampler.store.watermark("files").unwrap().as_deref(),
            Some("5")
        );

        sampler.tick_once().await.unwrap();

        let rows = sampler.store.samples(Some("files"), None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].new_count, 0);
        assert_eq!(rows[1].total_count, 5);
        assert!(rows[1].mean_ms.is_none());
        assert_eq!(
            sampler.store.watermark("files").unwrap().as_deref(),
            Some("5")
        );
    }

    #[tokio::test]
    async fn batch_limit_defers_the_tail_to_the_next_tick() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 5);
        let mut cfg = test_cfg(&dir, &["files"]);
        cfg.batch_limit = 2;
        let mut sampler = sampler_with(cfg, &upstream);

        sampler.tick_once().await.unwrap();
        assert_eq!(
            sampler.store.watermark("files").unwrap().as_deref(),
            Some("2")
        );

        sampler.tick_once().await.unwrap();
        assert_eq!(
            sampler.store.watermark("files").unwrap().as_deref(),
            Some("4")
        );

        let rows = sampler.store.samples(Some("files"), None).unwrap();
        assert_eq!(rows[0].new_count, 2);
        assert_eq!(rows[1].new_count, 2);
    }

    #[tokio::test]
    async fn failing_table_gets_a_fallback_sample_and_spares_the_rest() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 3);
        let conn = Connection::open(&upstream).unwrap();
        conn.execute_batch(
            "CREATE TABLE chunks (id INTEGER PRIMARY KEY, processing_time REAL);
             INSERT INTO chunks VALUES (1, 0.5);",
        )
        .unwrap();

        let mut sampler = sampler_with(test_cfg(&dir, &["files", "chunks"]), &upstream);
        sampler.tick_once().await.unwrap();

        conn.execute_batch("DROP TABLE chunks;").unwrap();
        sampler.tick_once().await.unwrap();

        // Gap-free: both tables have one sample per tick.
        let files = sampler.store.samples(Some("files"), None).unwrap();
        let chunks = sampler.store.samples(Some("chunks"), None).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(chunks.len(), 2);

        // The fallback sample is zero-valued; files are unaffected.
        assert_eq!(chunks[1].new_count, 0);
        assert_eq!(chunks[1].total_count, 0);
        assert!(chunks[1].mean_ms.is_none());
        assert_eq!(files[1].total_count, 3);

        // The watermark survives the failure for the eventual recovery.
        assert_eq!(
            sampler.store.watermark("chunks").unwrap().as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn fits_appear_once_the_series_is_non_empty() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 5);
        let mut sampler = sampler_with(test_cfg(&dir, &["files"]), &upstream);

        sampler.tick_once().await.unwrap();

        let latest = sampler.store.latest_fits("files").unwrap();
        let linear = latest.linear.unwrap();
        assert_eq!(linear.sample_count, 5);
        // Durations rise 10..50 by 10: a perfect slope-10 line.
        assert!((linear.slope - 10.0).abs() < 1e-9);
        assert!(latest.exponential.is_some());

        // An empty tick still refits over the unchanged series.
        sampler.tick_once().await.unwrap();
        let history = sampler.store.fits_all().unwrap();
        assert_eq!(history.len(), 4);
    }

    #[tokio::test]
    async fn empty_series_never_reaches_the_fitter() {
        let dir = TempDir::new().unwrap();
        let upstream = dir.path().join("upstream.sqlite");
        let conn = Connection::open(&upstream).unwrap();
        // No duration convention at all: records are only counted.
        conn.execute_batch(
            "CREATE TABLE ledger (id INTEGER PRIMARY KEY, note TEXT);
             INSERT INTO ledger VALUES (1, 'a'), (2, 'b');",
        )
        .unwrap();

        let mut sampler = sampler_with(test_cfg(&dir, &["ledger"]), &upstream);
        sampler.tick_once().await.unwrap();

        let rows = sampler.store.samples(Some("ledger"), None).unwrap();
        assert_eq!(rows[0].new_count, 2);
        assert!(rows[0].mean_ms.is_none());
        assert!(sampler.store.fits_all().unwrap().is_empty());
        // The watermark still advances; counting-only tables stay cheap.
        assert_eq!(
            sampler.store.watermark("ledger").unwrap().as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn export_cadence_writes_artifacts() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 3);
        let mut cfg = test_cfg(&dir, &["files"]);
        cfg.export_every = 1;
        let export_dir = cfg.export_dir.clone();
        let mut sampler = sampler_with(cfg, &upstream);

        sampler.tick_once().await.unwrap();

        assert!(export_dir.join("report.md").exists());
        assert!(export_dir.join("samples_head.csv").exists());
        assert!(export_dir.join("files_head.json").exists());
    }

    #[tokio::test]
    async fn the_loop_runs_as_a_spawned_task_until_shutdown() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 2);
        let cfg = test_cfg(&dir, &["files"]);
        let store = MonitorStore::open(&cfg.store_path).unwrap();
        let running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());

        let sampler = Sampler::new(
            store,
            Arc::new(SqliteSource::new(&upstream)),
            Arc::new(SamplerHealth::new()),
            running.clone(),
            shutdown.clone(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(cfg),
        );
        let task = tokio::spawn(sampler.run());

        running.store(false, Ordering::SeqCst);
        shutdown.notify_one();

        let joined = tokio::time::timeout(Duration::from_secs(5), task).await;
        joined.unwrap().unwrap().unwrap();
    }

    #[tokio::test]
    async fn a_blocked_upstream_times_out_into_a_fallback_sample() {
        let dir = TempDir::new().unwrap();
        let upstream = files_upstream(&dir, 3);
        // Hold the write lock so every query stalls on the busy handler.
        let blocker = Connection::open(&upstream).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();

        let mut cfg = test_cfg(&dir, &["files"]);
        cfg.query_timeout_secs = 0;
        let mut sampler = sampler_with(cfg, &upstream);
        sampler.tick_once().await.unwrap();

        blocker.execute_batch("COMMIT;").unwrap();

        let rows = sampler.store.samples(Some("files"), None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].new_count, 0);
        assert_eq!(rows[0].total_count, 0);
        assert!(sampler.store.watermark("files").unwrap().is_none());

        let snapshot = sampler.health.snapshot();
        let error = snapshot.tables["files"].last_error.clone().unwrap();
        assert!(error.contains("timed out"));
    }

    #[tokio::test]
    async fn collections_created_empty_learn_durations_once_records_arrive() {
        let dir = TempDir::new().unwrap();
        let docs = Arc::new(MemoryDocs::default());
        let mut sampler = doc_sampler(test_cfg(&dir, &["files"]), docs.clone());

        // Nothing upstream yet: the tick records a zero sample and must
        // not pin the blank schema for the life of the process.
        sampler.tick_once().await.unwrap();

        docs.push(1, 30.0);
        sampler.tick_once().await.unwrap();

        let rows = sampler.store.samples(Some("files"), None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].new_count, 0);
        assert_eq!(rows[1].new_count, 1);
        assert!((rows[1].mean_ms.unwrap() - 30.0).abs() < 1e-9);
        assert_eq!(
            sampler.store.watermark("files").unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    fn negative_policy_applies_per_value() {
        assert_eq!(apply_negative_policy(NegativeDurations::Keep, -5.0), Some(-5.0));
        assert_eq!(apply_negative_policy(NegativeDurations::Discard, -5.0), None);
        assert_eq!(apply_negative_policy(NegativeDurations::Clamp, -5.0), Some(0.0));
        assert_eq!(apply_negative_policy(NegativeDurations::Discard, 5.0), Some(5.0));
    }
}
