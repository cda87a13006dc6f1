pub mod export;
pub mod fits;
pub mod samples;
pub mod status;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::MonitorError;
use crate::store::MonitorStore;
use crate::AppState;

// ─── Unified error type ──────────────────────────────────────────

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Store(String),
    Internal(String),
    ExportRunning,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Store(msg) => (StatusCode::INTERNAL_SERVER_ERROR, format!("store: {msg}")),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            Self::ExportRunning => (StatusCode::CONFLICT, "Export already running".to_string()),
        };
        let body = serde_json::json!({
            "error":  message,
            "status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<MonitorError> for AppError {
    fn from(err: MonitorError) -> Self {
        AppError::Store(err.to_string())
    }
}

// ─── Store access ────────────────────────────────────────────────

/// Run a closure against a fresh read-only store handle on the blocking
/// pool. Connections are cheap to open and not shareable across awaits,
/// so each request gets its own.
pub async fn with_store<T, F>(state: &AppState, f: F) -> Result<T, AppError>
where
    T: Send + 'static,
    F: FnOnce(&MonitorStore) -> crate::error::Result<T> + Send + 'static,
{
    let path = state.cfg.store_path.clone();
    tokio::task::spawn_blocking(move || {
        let store = MonitorStore::open_readonly(&path)?;
        f(&store)
    })
    .await
    .map_err(|e| AppError::Internal(format!("task join: {e}")))?
    .map_err(AppError::from)
}

/// 404 for tables the monitor was not asked to track.
pub fn ensure_tracked(state: &AppState, table: &str) -> Result<(), AppError> {
    if state.cfg.tables.iter().any(|t| t == table) {
        Ok(())
    } else {
        Err(AppError::NotFound(format!("table '{table}' is not tracked")))
    }
}
