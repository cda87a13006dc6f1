use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;

use super::{with_store, AppError};
use crate::health::HealthSnapshot;
use crate::store::SampleRow;
use crate::AppState;

// ─── GET /api/status ─────────────────────────────────────────────

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<HealthSnapshot> {
    Json(state.health.snapshot())
}

// ─── GET /api/status/stream (SSE) ────────────────────────────────

/// Pushes a health snapshot every 2 seconds so a dashboard or a curl tail
/// can follow the sampler live.
pub async fn status_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let interval = tokio::time::interval(Duration::from_secs(2));
    let stream = IntervalStream::new(interval).map(move |_| {
        let snapshot = state.health.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

// ─── GET /metrics ────────────────────────────────────────────────

/// Plain-text gauges for scrapers, one labeled line per table per metric,
/// built from the latest stored sample. Serving from the store means the
/// endpoint keeps answering while the upstream is down.
pub async fn metrics_text(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let tables = state.cfg.tables.clone();
    let text = with_store(&state, move |store| {
        let mut latest = Vec::with_capacity(tables.len());
        for table in &tables {
            latest.push((table.clone(), store.latest_sample(table)?));
        }
        Ok(render_metrics(&latest))
    })
    .await?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
        .into_response())
}

/// `<metric>{table="<name>"} <value>` exposition text. Tables that have
/// never been sampled are omitted; null summaries omit the latency lines.
fn render_metrics(latest: &[(String, Option<SampleRow>)]) -> String {
    let mut out = String::new();
    for (table, sample) in latest {
        let Some(sample) = sample else { continue };
        out.push_str(&format!(
            "pipewatch_total_count{{table=\"{table}\"}} {}\n",
            sample.total_count
        ));
        if let Some(mean) = sample.mean_ms {
            out.push_str(&format!(
                "pipewatch_proc_mean_ms{{table=\"{table}\"}} {mean:.3}\n"
            ));
        }
        if let Some(p50) = sample.p50_ms {
            out.push_str(&format!(
                "pipewatch_proc_p50_ms{{table=\"{table}\"}} {p50:.3}\n"
            ));
        }
        if let Some(p95) = sample.p95_ms {
            out.push_str(&format!(
                "pipewatch_proc_p95_ms{{table=\"{table}\"}} {p95:.3}\n"
            ));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_per_table_gauges() {
        let sample = SampleRow {
            ts_utc: "2026-08-23T12:00:00.000Z".into(),
            table_name: "files".into(),
            total_count: 12,
            new_count: 3,
            mean_ms: Some(41.5),
            p50_ms: Some(40.0),
            p95_ms: Some(60.0),
        };
        let text = render_metrics(&[
            ("files".to_string(), Some(sample)),
            ("chunks".to_string(), None),
        ]);

        assert!(text.contains("pipewatch_total_count{table=\"files\"} 12\n"));
        assert!(text.contains("pipewatch_proc_mean_ms{table=\"files\"} 41.500\n"));
        assert!(text.contains("pipewatch_proc_p95_ms{table=\"files\"} 60.000\n"));
        // Never-sampled tables stay out of the exposition.
        assert!(!text.contains("chunks"));
    }

    #[test]
    fn null_summaries_emit_only_the_count() {
        let sample = SampleRow {
            ts_utc: "2026-08-23T12:00:00.000Z".into(),
            table_name: "ledger".into(),
            total_count: 7,
            new_count: 0,
            mean_ms: None,
            p50_ms: None,
            p95_ms: None,
        };
        let text = render_metrics(&[("ledger".to_string(), Some(sample))]);

        assert_eq!(text, "pipewatch_total_count{table=\"ledger\"} 7\n");
    }
}
