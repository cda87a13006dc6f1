use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppError;
use crate::exporter;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub artifacts: Vec<String>,
}

// ─── POST /api/export/run ────────────────────────────────────────

/// Kick a full export outside the tick cadence. The guard is shared with
/// the sampler so overlapping runs cannot interleave half-written files.
pub async fn run_export(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ExportResponse>, AppError> {
    if state.export_running.swap(true, Ordering::SeqCst) {
        return Err(AppError::ExportRunning);
    }

    let result = exporter::export_all(&state.cfg, state.source.as_ref()).await;
    state.export_running.store(false, Ordering::SeqCst);

    match result {
        Ok(paths) => {
            state.health.export_done();
            Ok(Json(ExportResponse {
                artifacts: paths.iter().map(|p| p.display().to_string()).collect(),
            }))
        }
        Err(err) => Err(AppError::Internal(format!("export failed: {err}"))),
    }
}
