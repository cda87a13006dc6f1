use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::Notify;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod error;
mod exporter;
mod extract;
mod handlers;
mod health;
mod middleware;
mod probe;
mod sampler;
mod seed;
mod server;
mod source;
mod store;
mod trend;

use config::Config;

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Runtime options: store path, tracked tables, export settings.
    pub cfg: Arc<Config>,

    /// Upstream adapter; the export trigger reads table heads through it.
    pub source: Arc<dyn source::UpstreamStore>,

    /// Sampler self-instrumentation behind `/api/status`.
    pub health: Arc<health::SamplerHealth>,

    /// Guard shared with the sampler so exports never overlap.
    pub export_running: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Arc::new(Config::parse());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,pipewatch=debug")),
        )
        .init();

    println!();
    println!("╔══════════════════════════════════════════════════╗");
    println!("║   pipewatch - pipeline growth & latency monitor  ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    // ── 1. Open the local store (fatal if unavailable) ───────────
    let store = store::MonitorStore::open(&cfg.store_path)
        .with_context(|| format!("opening local store at {}", cfg.store_path.display()))?;
    println!("Local store     → {}", cfg.store_path.display());

    // ── 2. Connect the upstream adapter ──────────────────────────
    let source: Arc<dyn source::UpstreamStore> = if source::is_redis_url(&cfg.source_url) {
        let redis = source::RedisSource::connect(&cfg.source_url)
            .await
            .with_context(|| format!("connecting to {}", cfg.source_url))?;
        if cfg.seed_demo {
            seed::seed(redis.connection())
                .await
                .context("seeding demo pipeline")?;
        }
        Arc::new(redis)
    } else {
        if cfg.seed_demo {
            anyhow::bail!("--seed-demo needs a redis:// source URL");
        }
        Arc::new(source::SqliteSource::new(source::sqlite_path(
            &cfg.source_url,
        )))
    };
    println!("Upstream        → {}", cfg.source_url);

    // ── 3. Shared state and the sampler task ─────────────────────
    let health = Arc::new(health::SamplerHealth::new());
    let running = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());
    let export_running = Arc::new(AtomicBool::new(false));

    let sampler = sampler::Sampler::new(
        store,
        source.clone(),
        health.clone(),
        running.clone(),
        shutdown.clone(),
        export_running.clone(),
        cfg.clone(),
    );
    let mut sampler_task = tokio::spawn(sampler.run());

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        source,
        health,
        export_running,
    });

    // ── 4. Bind and serve ────────────────────────────────────────
    let app = server::create_router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.listen)
        .await
        .with_context(|| format!("binding {}", cfg.listen))?;

    println!();
    println!("Samples         → http://{}/api/samples", cfg.listen);
    println!("Status (SSE)    → http://{}/api/status/stream", cfg.listen);
    println!("Metrics text    → http://{}/metrics", cfg.listen);
    println!();

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(running.clone(), shutdown.clone()));
    let mut server_task = tokio::spawn(async move { server.await });

    // A sampler exit while serving means the local store failed; bail out
    // rather than keep serving stale data.
    tokio::select! {
        res = &mut server_task => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(anyhow::Error::from(e).context("http server")),
                Err(e) => return Err(anyhow::anyhow!("server panicked: {e}")),
            }
        }
        res = &mut sampler_task => {
            return match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "sampler failed");
                    Err(e.into())
                }
                Err(e) => Err(anyhow::anyhow!("sampler panicked: {e}")),
            };
        }
    }

    // Graceful path: the signal fired and the server drained; wait for the
    // loop to finish its in-flight tick.
    match sampler_task.await {
        Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "sampler failed during shutdown");
            Err(e.into())
        }
        Err(e) => Err(anyhow::anyhow!("sampler panicked: {e}")),
    }
}

/// Resolves when ctrl-c arrives: flips the run flag and wakes the sampler
/// out of its inter-tick sleep. The stored permit covers a signal landing
/// mid-tick.
async fn wait_for_shutdown(running: Arc<AtomicBool>, shutdown: Arc<Notify>) {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available; run until killed.
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    running.store(false, Ordering::SeqCst);
    shutdown.notify_one();
}
