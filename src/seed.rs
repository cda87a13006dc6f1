//! Demo pipeline seeding: five tables, one per duration convention, so a
//! fresh monitor has something to watch. Only meaningful against the
//! document-store upstream; key layout matches the Redis adapter.

use std::time::Instant;

use chrono::{DateTime, Duration as TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use redis::aio::ConnectionManager;
use tracing::info;
use uuid::Uuid;

use crate::source::RedisSource;

// ─── Volumes ─────────────────────────────────────────────────────

const NUM_FILES: usize = 400;
const NUM_CHUNKS: usize = 900;
const NUM_CANDIDATES: usize = 250;
const NUM_CLONES: usize = 120;
const NUM_STATUS: usize = 60;

/// Records per pipelined round trip.
const BATCH: usize = 500;

const STAGES: &[&str] = &["ingest", "chunk", "index", "match", "persist"];

/// Seed the whole demo pipeline. The RNG is fixed so payloads are stable
/// across runs; only the timestamps float with the clock.
pub async fn seed(conn: &ConnectionManager) -> redis::RedisResult<()> {
    let started = Instant::now();
    info!("seeding demo pipeline");

    let mut conn = conn.clone();
    let mut rng = StdRng::seed_from_u64(42);
    let base = Utc::now() - TimeDelta::hours(6);

    seed_files(&mut conn, &mut rng).await?;
    seed_chunks(&mut conn, &mut rng).await?;
    seed_candidates(&mut conn, &mut rng, base).await?;
    seed_clones(&mut conn, &mut rng, base).await?;
    seed_status(&mut conn, base).await?;

    info!(
        records = NUM_FILES + NUM_CHUNKS + NUM_CANDIDATES + NUM_CLONES + NUM_STATUS,
        elapsed = ?started.elapsed(),
        "demo seed complete"
    );
    Ok(())
}

/// files: milliseconds field, drifting gently upward so the fits have a
/// slope to find.
async fn seed_files(conn: &mut ConnectionManager, rng: &mut StdRng) -> redis::RedisResult<()> {
    for batch_start in (0..NUM_FILES).step_by(BATCH) {
        let mut pipe = redis::pipe();
        for i in batch_start..(batch_start + BATCH).min(NUM_FILES) {
            let id = (i + 1).to_string();
            let ms = 40.0 + 0.08 * (i + 1) as f64 + rng.gen_range(-6.0..6.0);
            pipe.cmd("HSET")
                .arg(RedisSource::record_key("files", &id))
                .arg("id")
                .arg(&id)
                .arg("path")
                .arg(format!("/ingest/batch_{:03}/file_{:05}.bin", i / 50 + 1, i + 1))
                .arg("size_bytes")
                .arg(rng.gen_range(4_096u64..2_000_000))
                .arg("processing_time_ms")
                .arg(format!("{ms:.2}"))
                .ignore();
            pipe.cmd("ZADD")
                .arg(RedisSource::index_key("files"))
                .arg(i + 1)
                .arg(&id)
                .ignore();
        }
        let _: () = pipe.query_async(conn).await?;
    }
    Ok(())
}

/// chunks: seconds field.
async fn seed_chunks(conn: &mut ConnectionManager, rng: &mut StdRng) -> redis::RedisResult<()> {
    for batch_start in (0..NUM_CHUNKS).step_by(BATCH) {
        let mut pipe = redis::pipe();
        for i in batch_start..(batch_start + BATCH).min(NUM_CHUNKS) {
            let id = (i + 1).to_string();
            let secs = 0.05 + 0.0002 * (i + 1) as f64 + rng.gen_range(-0.01..0.01);
            pipe.cmd("HSET")
                .arg(RedisSource::record_key("chunks", &id))
                .arg("id")
                .arg(&id)
                .arg("file_id")
                .arg(rng.gen_range(1..=NUM_FILES))
                .arg("ordinal")
                .arg(i % 16)
                .arg("processing_time")
                .arg(format!("{secs:.4}"))
                .ignore();
            pipe.cmd("ZADD")
                .arg(RedisSource::index_key("chunks"))
                .arg(i + 1)
                .arg(&id)
                .ignore();
        }
        let _: () = pipe.query_async(conn).await?;
    }
    Ok(())
}

/// candidates: RFC 3339 start/end pair.
async fn seed_candidates(
    conn: &mut ConnectionManager,
    rng: &mut StdRng,
    base: DateTime<Utc>,
) -> redis::RedisResult<()> {
    for batch_start in (0..NUM_CANDIDATES).step_by(BATCH) {
        let mut pipe = redis::pipe();
        for i in batch_start..(batch_start + BATCH).min(NUM_CANDIDATES) {
            let id = (i + 1).to_string();
            let span_ms = 90.0 + 0.5 * (i + 1) as f64 + rng.gen_range(-15.0..15.0);
            let start = base + TimeDelta::seconds(2 * i as i64);
            let end = start + TimeDelta::milliseconds(span_ms as i64);
            pipe.cmd("HSET")
                .arg(RedisSource::record_key("candidates", &id))
                .arg("id")
                .arg(&id)
                .arg("chunk_a")
                .arg(rng.gen_range(1..=NUM_CHUNKS))
                .arg("chunk_b")
                .arg(rng.gen_range(1..=NUM_CHUNKS))
                .arg("start_time")
                .arg(start.to_rfc3339())
                .arg("end_time")
                .arg(end.to_rfc3339())
                .ignore();
            pipe.cmd("ZADD")
                .arg(RedisSource::index_key("candidates"))
                .arg(i + 1)
                .arg(&id)
                .ignore();
        }
        let _: () = pipe.query_async(conn).await?;
    }
    Ok(())
}

/// clones: queued/created pair in the space-separated timestamp form, to
/// exercise the second parser path.
async fn seed_clones(
    conn: &mut ConnectionManager,
    rng: &mut StdRng,
    base: DateTime<Utc>,
) -> redis::RedisResult<()> {
    for batch_start in (0..NUM_CLONES).step_by(BATCH) {
        let mut pipe = redis::pipe();
        for i in batch_start..(batch_start + BATCH).min(NUM_CLONES) {
            let id = (i + 1).to_string();
            let wait_ms = 250.0 + 1.2 * (i + 1) as f64 + rng.gen_range(-40.0..40.0);
            let queued = base + TimeDelta::seconds(5 * i as i64);
            let created = queued + TimeDelta::milliseconds(wait_ms as i64);
            pipe.cmd("HSET")
                .arg(RedisSource::record_key("clones", &id))
                .arg("id")
                .arg(&id)
                .arg("candidate_id")
                .arg(rng.gen_range(1..=NUM_CANDIDATES))
                .arg("pair_key")
                .arg(Uuid::new_v4().to_string())
                .arg("similarity")
                .arg(format!("{:.3}", rng.gen_range(0.82..0.999)))
                .arg("queued_at")
                .arg(queued.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                .arg("created_at")
                .arg(created.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
                .ignore();
            pipe.cmd("ZADD")
                .arg(RedisSource::index_key("clones"))
                .arg(i + 1)
                .arg(&id)
                .ignore();
        }
        let _: () = pipe.query_async(conn).await?;
    }
    Ok(())
}

/// status_updates: no duration fields at all; the monitor should probe
/// this one to "count only".
async fn seed_status(conn: &mut ConnectionManager, base: DateTime<Utc>) -> redis::RedisResult<()> {
    for batch_start in (0..NUM_STATUS).step_by(BATCH) {
        let mut pipe = redis::pipe();
        for i in batch_start..(batch_start + BATCH).min(NUM_STATUS) {
            let id = (i + 1).to_string();
            let stage = STAGES[i % STAGES.len()];
            let ts = base + TimeDelta::seconds(30 * i as i64);
            pipe.cmd("HSET")
                .arg(RedisSource::record_key("status_updates", &id))
                .arg("id")
                .arg(&id)
                .arg("stage")
                .arg(stage)
                .arg("message")
                .arg(format!("{stage} batch {} complete", i / STAGES.len() + 1))
                .arg("ts")
                .arg(ts.to_rfc3339())
                .ignore();
            pipe.cmd("ZADD")
                .arg(RedisSource::index_key("status_updates"))
                .arg(i + 1)
                .arg(&id)
                .ignore();
        }
        let _: () = pipe.query_async(conn).await?;
    }
    Ok(())
}
