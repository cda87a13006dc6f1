//! Runtime options. Every flag has a `PW_*` environment fallback so a
//! container deployment can run flag-free.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

// ─── Negative-duration policy ────────────────────────────────────

/// Treatment of a derived duration below zero, which shows up when
/// timestamp pairs are misordered or clocks drift between writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NegativeDurations {
    /// Record the value as-is.
    Keep,
    /// Treat the value as unknown.
    Discard,
    /// Floor the value at zero.
    Clamp,
}

// ─── CLI ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Parser)]
#[command(name = "pipewatch", about = "Pipeline growth and latency monitor", version)]
pub struct Config {
    /// Upstream store URL: redis:// for the document adapter, anything
    /// else is a SQLite file path (optional sqlite:// prefix).
    #[arg(long, env = "PW_SOURCE_URL", default_value = "sqlite://data/pipeline.sqlite")]
    pub source_url: String,

    /// Comma-separated tables/collections to track.
    #[arg(
        long,
        env = "PW_TRACK_TABLES",
        value_delimiter = ',',
        default_value = "files,chunks,candidates,clones,status_updates"
    )]
    pub tables: Vec<String>,

    /// Auxiliary status table counted once per tick; empty disables the poll.
    #[arg(long, env = "PW_STATUS_TABLE", default_value = "status_updates")]
    pub status_table: String,

    /// Seconds between sampler ticks.
    #[arg(
        long,
        env = "PW_SAMPLE_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub interval_secs: u64,

    /// Local monitor store (samples, durations, fits, watermarks).
    #[arg(long, env = "PW_STORE_PATH", default_value = "data/monitor.sqlite")]
    pub store_path: PathBuf,

    /// Directory the exporter writes artifacts into.
    #[arg(long, env = "PW_EXPORT_DIR", default_value = "data/exports")]
    pub export_dir: PathBuf,

    /// Rows per CSV head and records per JSON head dump.
    #[arg(long, env = "PW_HEAD_LIMIT", default_value_t = 100)]
    pub head_limit: usize,

    /// Run the exporter every N ticks; 0 disables the cadence.
    #[arg(long, env = "PW_EXPORT_EVERY_TICKS", default_value_t = 2)]
    pub export_every: u64,

    /// Most records pulled past the watermark per table per tick. Anything
    /// beyond the cap waits for the next tick.
    #[arg(long, env = "PW_SCAN_BATCH_LIMIT", default_value_t = 10_000)]
    pub batch_limit: usize,

    /// Upstream per-query timeout in seconds.
    #[arg(long, env = "PW_QUERY_TIMEOUT_SECS", default_value_t = 10)]
    pub query_timeout_secs: u64,

    /// Policy for negative derived durations.
    #[arg(long, env = "PW_NEGATIVE_DURATIONS", value_enum, default_value = "keep")]
    pub negative_durations: NegativeDurations,

    /// HTTP listen address.
    #[arg(long, env = "PW_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: String,

    /// Seed a synthetic pipeline into the upstream at startup (redis only).
    #[arg(long, env = "PW_SEED_DEMO")]
    pub seed_demo: bool,
}

impl Config {
    /// Status polling is optional; an empty table name switches it off.
    pub fn status_source(&self) -> Option<&str> {
        let name = self.status_table.trim();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}
