use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::handlers;
use crate::middleware::timing;
use crate::AppState;

/// Builds the full Axum `Router`: the read surface over the local store,
/// sampler status, the metrics text endpoint, and the export trigger.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Sample history ──────────────────────────────────────
        .route("/api/samples", get(handlers::samples::all_samples))
        .route(
            "/api/samples/:table",
            get(handlers::samples::table_samples),
        )
        // ── Fit history and classification ──────────────────────
        .route("/api/fits", get(handlers::fits::all_fits))
        .route("/api/fits/:table", get(handlers::fits::table_fits))
        // ── Sampler status ──────────────────────────────────────
        .route("/api/status", get(handlers::status::get_status))
        .route("/api/status/stream", get(handlers::status::status_stream))
        // ── Export trigger ──────────────────────────────────────
        .route("/api/export/run", post(handlers::export::run_export))
        // ── Scrape surface ──────────────────────────────────────
        .route("/metrics", get(handlers::status::metrics_text))
        // ── Provide shared state to all routes above ────────────
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(axum_mw::from_fn(timing::timing_middleware))
        .layer(CorsLayer::permissive())
}
