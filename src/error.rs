use thiserror::Error;

use crate::source::SourceError;

/// Process-level failures. Upstream trouble never reaches this type: the
/// sampler absorbs it per table. What does reach it is the local store and
/// the export writers; a local-store failure stops the process before the
/// watermarks and the archived history can diverge.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("local store: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv export: {0}")]
    Csv(#[from] csv::Error),

    #[error("json export: {0}")]
    Json(#[from] serde_json::Error),

    #[error("upstream: {0}")]
    Source(#[from] SourceError),

    #[error("export worker: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, MonitorError>;
