//! Schema probing: which duration convention does a table speak?
//!
//! Conventions are ranked; the first whose fields are all present wins.
//! The result is a small profile the extractor dispatches on. Probing runs
//! per table, never per record; the sampler caches the profile once the
//! table has a schema to show.

use crate::source::TableSchema;

// ─── Recognized field names ──────────────────────────────────────

const MS_FIELDS: &[&str] = &["processing_time_ms", "duration_ms"];
const SECS_FIELDS: &[&str] = &["processing_time", "duration"];
const START_FIELD: &str = "start_time";
const END_FIELD: &str = "end_time";
const QUEUED_FIELD: &str = "queued_at";
const CREATED_FIELDS: &[&str] = &["created_at", "inserted_at"];

/// Identifier fallback when nothing better is declared.
const ID_FIELD: &str = "id";

// ─── Profiles ────────────────────────────────────────────────────

/// How to pull a duration out of one record.
#[derive(Debug, Clone, PartialEq)]
pub enum DurationConvention {
    /// Field already in milliseconds.
    Millis { field: String },
    /// Field in seconds, scaled by 1000 on extraction.
    Seconds { field: String },
    /// Wall-clock span end - start.
    StartEnd { start: String, end: String },
    /// Wall-clock span created - queued.
    QueuedCreated { queued: String, created: String },
    /// Nothing recognized; records are only counted.
    None,
}

impl DurationConvention {
    /// Short label for status output and the export report.
    pub fn name(&self) -> &'static str {
        match self {
            DurationConvention::Millis { .. } => "ms_field",
            DurationConvention::Seconds { .. } => "seconds_field",
            DurationConvention::StartEnd { .. } => "start_end",
            DurationConvention::QueuedCreated { .. } => "queued_created",
            DurationConvention::None => "none",
        }
    }
}

/// What one probe learned about a table: how to order it and how to read
/// a duration from it.
#[derive(Debug, Clone, PartialEq)]
pub struct CapabilityProfile {
    pub id_column: String,
    pub convention: DurationConvention,
}

/// Identifier used for ordering and watermarks: the declared primary key,
/// then a column literally named `id`, then the first column.
pub fn identifier_column(schema: &TableSchema) -> Option<String> {
    if let Some(pk) = &schema.primary_key {
        return Some(pk.clone());
    }
    if schema.columns.iter().any(|c| c == ID_FIELD) {
        return Some(ID_FIELD.to_string());
    }
    schema.columns.first().cloned()
}

/// Derive a profile from an already-fetched schema.
pub fn profile_from_schema(schema: &TableSchema) -> CapabilityProfile {
    let id_column = identifier_column(schema).unwrap_or_else(|| ID_FIELD.to_string());
    CapabilityProfile {
        id_column,
        convention: detect_convention(&schema.columns),
    }
}

fn detect_convention(columns: &[String]) -> DurationConvention {
    let has = |name: &str| columns.iter().any(|c| c == name);

    if let Some(f) = MS_FIELDS.iter().find(|f| has(f)) {
        return DurationConvention::Millis {
            field: f.to_string(),
        };
    }
    if let Some(f) = SECS_FIELDS.iter().find(|f| has(f)) {
        return DurationConvention::Seconds {
            field: f.to_string(),
        };
    }
    if has(START_FIELD) && has(END_FIELD) {
        return DurationConvention::StartEnd {
            start: START_FIELD.to_string(),
            end: END_FIELD.to_string(),
        };
    }
    if has(QUEUED_FIELD) {
        if let Some(c) = CREATED_FIELDS.iter().find(|f| has(f)) {
            return DurationConvention::QueuedCreated {
                queued: QUEUED_FIELD.to_string(),
                created: c.to_string(),
            };
        }
    }
    DurationConvention::None
}
