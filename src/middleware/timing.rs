use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

/// Adds two response headers:
///
///   X-Response-Time-Us  - handler wall time in microseconds
///   Server-Timing       - the same value in the standard format
///
/// API requests also get a debug-level access line; the SSE stream and
/// metrics scrapes are left out so they cannot flood the log.
pub async fn timing_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let start = Instant::now();
    let mut response = next.run(req).await;
    let elapsed = start.elapsed();
    let us = elapsed.as_micros();

    // ── Inject response headers ─────────────────────────────────
    if let Ok(value) = us.to_string().parse() {
        response.headers_mut().insert("X-Response-Time-Us", value);
    }
    let server_timing = format!("total;dur={:.3}", elapsed.as_secs_f64() * 1000.0);
    if let Ok(value) = server_timing.parse() {
        response.headers_mut().insert("Server-Timing", value);
    }

    // ── Access log ──────────────────────────────────────────────
    if path.starts_with("/api/") && !path.ends_with("/stream") {
        let status = response.status().as_u16();
        debug!(%method, %path, status, us = us as u64, "request");
    }

    response
}
