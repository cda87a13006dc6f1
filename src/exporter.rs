//! Offline artifacts: CSV heads of the sample and fit history, a JSON head
//! dump per tracked table, and a markdown report classifying each table's
//! trend. Runs on the tick cadence and on demand from the API. Artifacts
//! are written independently so one unreachable table cannot sink the run.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::source::{RawRecord, UpstreamStore};
use crate::store::MonitorStore;

/// Run one full export into `cfg.export_dir`. Returns the paths written.
pub async fn export_all(cfg: &Config, source: &dyn UpstreamStore) -> Result<Vec<PathBuf>> {
    let mut artifacts = store_artifacts(cfg).await?;

    for table in &cfg.tables {
        match head_dump(source, table, &cfg.export_dir, cfg.head_limit).await {
            Ok(path) => artifacts.push(path),
            Err(err) => warn!(table = %table, error = %err, "head dump skipped"),
        }
    }

    Ok(artifacts)
}

/// The store-backed artifacts (both CSV heads and the report), written in
/// one pass on the blocking pool; the API handler must not stall a worker
/// on store reads and file writes.
async fn store_artifacts(cfg: &Config) -> Result<Vec<PathBuf>> {
    let store_path = cfg.store_path.clone();
    let export_dir = cfg.export_dir.clone();
    let head_limit = cfg.head_limit;
    let tables = cfg.tables.clone();

    tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&export_dir)?;
        let store = MonitorStore::open_readonly(&store_path)?;
        Ok(vec![
            write_samples_head(&store, &export_dir, head_limit)?,
            write_fits(&store, &export_dir)?,
            write_report(&store, &tables, &export_dir)?,
        ])
    })
    .await?
}

fn write_samples_head(store: &MonitorStore, dir: &Path, limit: usize) -> Result<PathBuf> {
    let path = dir.join("samples_head.csv");
    let mut writer = csv::Writer::from_writer(fs::File::create(&path)?);
    for row in store.samples_head(limit)? {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(path)
}

fn write_fits(store: &MonitorStore, dir: &Path) -> Result<PathBuf> {
    let path = dir.join("fits.csv");
    let mut writer = csv::Writer::from_writer(fs::File::create(&path)?);
    for row in store.fits_all()? {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(path)
}

async fn head_dump(
    source: &dyn UpstreamStore,
    table: &str,
    dir: &Path,
    limit: usize,
) -> Result<PathBuf> {
    let records = source.head(table, limit).await?;
    let docs: Vec<serde_json::Map<String, serde_json::Value>> =
        records.iter().map(record_to_json).collect();

    let json = serde_json::to_string_pretty(&docs)?;
    let path = dir.join(format!("{table}_head.json"));
    let target = path.clone();
    tokio::task::spawn_blocking(move || fs::write(&target, json)).await??;
    Ok(path)
}

fn record_to_json(record: &RawRecord) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    for (name, value) in &record.fields {
        map.insert(name.clone(), value.to_json());
    }
    map
}

fn write_report(store: &MonitorStore, tables: &[String], dir: &Path) -> Result<PathBuf> {
    let mut md = String::new();
    md.push_str("# Pipeline monitor report\n\n");
    md.push_str(&format!(
        "Generated: {}\n\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    ));
    md.push_str("## Trend summary\n\n");

    for table in tables {
        let fits = store.latest_fits(table)?;
        md.push_str(&format!("### {table}\n\n"));
        md.push_str(&format!(
            "- classification: **{}**\n",
            fits.classify().describe()
        ));
        if let Some(f) = &fits.linear {
            md.push_str(&format!(
                "- linear: slope={:.6} ms/record, intercept={:.3}, r2={:.4}, n={}\n",
                f.slope, f.intercept, f.r_squared, f.sample_count
            ));
        }
        if let Some(f) = &fits.exponential {
            md.push_str(&format!(
                "- exponential (log-space): slope={:.6}, intercept={:.3}, r2={:.4}, n={}\n",
                f.slope, f.intercept, f.r_squared, f.sample_count
            ));
        }
        if let Some(s) = store.latest_sample(table)? {
            md.push_str(&format!(
                "- latest sample: total={}, new={}, mean={} ms\n",
                s.total_count,
                s.new_count,
                fmt_ms(s.mean_ms)
            ));
        }
        md.push('\n');
    }

    let path = dir.join("report.md");
    fs::write(&path, md)?;
    Ok(path)
}

fn fmt_ms(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{v:.1}"),
        None => "n/a".to_string(),
    }
}
