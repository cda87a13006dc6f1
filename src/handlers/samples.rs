use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use super::{ensure_tracked, with_store, AppError};
use crate::store::SampleRow;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SampleQuery {
    /// Keep only the newest N rows; the response stays ascending.
    pub limit: Option<usize>,
}

// ─── GET /api/samples ────────────────────────────────────────────

pub async fn all_samples(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SampleQuery>,
) -> Result<Json<Vec<SampleRow>>, AppError> {
    let rows = with_store(&state, move |store| store.samples(None, query.limit)).await?;
    Ok(Json(rows))
}

// ─── GET /api/samples/:table ─────────────────────────────────────

pub async fn table_samples(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(query): Query<SampleQuery>,
) -> Result<Json<Vec<SampleRow>>, AppError> {
    ensure_tracked(&state, &table)?;
    let rows = with_store(&state, move |store| {
        store.samples(Some(table.as_str()), query.limit)
    })
    .await?;
    Ok(Json(rows))
}
