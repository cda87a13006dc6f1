//! Sampler self-instrumentation: how long ticks take, what each table's
//! last scan looked like, when the loop last ran. The sampler writes
//! between table scans; the HTTP surface reads point-in-time snapshots.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// HdrHistogram bounds for tick durations: 1 microsecond to 10 minutes,
/// 3 significant figures.
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 600_000_000;
const HIST_SIGFIG: u8 = 3;

/// Thread-safe health collector shared between the sampler task and the
/// HTTP handlers.
pub struct SamplerHealth {
    inner: Mutex<Inner>,
}

/// Outcome of one table's most recent pass through the sampler.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TableState {
    pub last_total: u64,
    pub last_new: usize,
    pub last_ok_at: Option<String>,
    /// Present while the table is failing; cleared on the next clean scan.
    pub last_error: Option<String>,
    pub convention: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub max_ms: f64,
}

/// Snapshot shipped to `/api/status` and the SSE stream.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub started_at: String,
    pub ticks: u64,
    pub last_tick_at: Option<String>,
    pub last_tick_ms: f64,
    pub tick_durations: Option<TickPercentiles>,
    pub tables: BTreeMap<String, TableState>,
    pub status_update_count: Option<u64>,
    pub export_runs: u64,
}

struct Inner {
    started_at: DateTime<Utc>,
    ticks: u64,
    last_tick_at: Option<DateTime<Utc>>,
    last_tick_ms: f64,
    tick_hist: Histogram<u64>,
    tables: BTreeMap<String, TableState>,
    status_update_count: Option<u64>,
    export_runs: u64,
}

impl SamplerHealth {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                started_at: Utc::now(),
                ticks: 0,
                last_tick_at: None,
                last_tick_ms: 0.0,
                tick_hist: Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
                    .expect("histogram creation"),
                tables: BTreeMap::new(),
                status_update_count: None,
                export_runs: 0,
            }),
        }
    }

    /// One table scanned clean this tick.
    pub fn table_ok(
        &self,
        table: &str,
        total: u64,
        new: usize,
        convention: &'static str,
        at: DateTime<Utc>,
    ) {
        let mut inner = self.inner.lock();
        let entry = inner.tables.entry(table.to_string()).or_default();
        entry.last_total = total;
        entry.last_new = new;
        entry.last_ok_at = Some(rfc3339(at));
        entry.last_error = None;
        entry.convention = Some(convention.to_string());
    }

    /// A table-level failure; the error sticks until the next clean scan.
    pub fn table_failed(&self, table: &str, error: &str, total: u64) {
        let mut inner = self.inner.lock();
        let entry = inner.tables.entry(table.to_string()).or_default();
        entry.last_total = total;
        entry.last_new = 0;
        entry.last_error = Some(error.to_string());
    }

    pub fn tick_done(&self, took: Duration, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.ticks += 1;
        inner.last_tick_at = Some(at);
        inner.last_tick_ms = took.as_secs_f64() * 1000.0;
        let us = (took.as_micros() as u64).max(1);
        let _ = inner.tick_hist.record(us);
    }

    pub fn status_count(&self, count: u64) {
        self.inner.lock().status_update_count = Some(count);
    }

    pub fn export_done(&self) {
        self.inner.lock().export_runs += 1;
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock();
        let tick_durations = if inner.tick_hist.len() == 0 {
            None
        } else {
            Some(TickPercentiles {
                p50_ms: inner.tick_hist.value_at_percentile(50.0) as f64 / 1000.0,
                p95_ms: inner.tick_hist.value_at_percentile(95.0) as f64 / 1000.0,
                max_ms: inner.tick_hist.max() as f64 / 1000.0,
            })
        };
        HealthSnapshot {
            started_at: rfc3339(inner.started_at),
            ticks: inner.ticks,
            last_tick_at: inner.last_tick_at.map(rfc3339),
            last_tick_ms: inner.last_tick_ms,
            tick_durations,
            tables: inner.tables.clone(),
            status_update_count: inner.status_update_count,
            export_runs: inner.export_runs,
        }
    }
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}
