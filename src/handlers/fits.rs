use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;

use super::{ensure_tracked, with_store, AppError};
use crate::store::FitRow;
use crate::AppState;

/// Newest fit of each kind for one table, with the resulting trend call.
#[derive(Debug, Serialize)]
pub struct TableFits {
    pub table_name: String,
    pub trend: &'static str,
    pub linear: Option<FitRow>,
    pub exponential: Option<FitRow>,
}

// ─── GET /api/fits ───────────────────────────────────────────────

/// Full fit history, newest first.
pub async fn all_fits(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<FitRow>>, AppError> {
    let rows = with_store(&state, |store| store.fits_all()).await?;
    Ok(Json(rows))
}

// ─── GET /api/fits/:table ────────────────────────────────────────

pub async fn table_fits(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
) -> Result<Json<TableFits>, AppError> {
    ensure_tracked(&state, &table)?;

    let lookup = table.clone();
    let latest = with_store(&state, move |store| store.latest_fits(&lookup)).await?;

    let trend = latest.classify().describe();
    Ok(Json(TableFits {
        table_name: table,
        trend,
        linear: latest.linear,
        exponential: latest.exponential,
    }))
}
