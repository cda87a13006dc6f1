//! Per-record duration derivation. Pure: a record and a profile in, an
//! optional milliseconds value out. Missing or unparseable fields mean
//! "unknown", never an error, so one dirty record cannot fail a scan.

use chrono::{DateTime, NaiveDateTime};

use crate::probe::{CapabilityProfile, DurationConvention};
use crate::source::{FieldValue, RawRecord};

pub fn extract(record: &RawRecord, profile: &CapabilityProfile) -> Option<f64> {
    let ms = match &profile.convention {
        DurationConvention::Millis { field } => numeric(record, field),
        DurationConvention::Seconds { field } => numeric(record, field).map(|s| s * 1000.0),
        DurationConvention::StartEnd { start, end } => span_ms(record, start, end),
        DurationConvention::QueuedCreated { queued, created } => span_ms(record, queued, created),
        DurationConvention::None => None,
    };
    // "nan" and "inf" parse as floats but carry no duration; a NaN here
    // would poison every mean and percentile downstream.
    ms.filter(|ms| ms.is_finite())
}

fn numeric(record: &RawRecord, field: &str) -> Option<f64> {
    record.field(field)?.as_f64()
}

/// Elapsed milliseconds from `from` to `to`. Comes out negative when the
/// pair is misordered; the caller's negative-duration policy decides what
/// happens then.
fn span_ms(record: &RawRecord, from: &str, to: &str) -> Option<f64> {
    Some(epoch_ms(record.field(to)?)? - epoch_ms(record.field(from)?)?)
}

/// Timestamp field to epoch milliseconds. Numeric values are epoch
/// seconds; text is RFC 3339 or `YYYY-MM-DD HH:MM:SS[.fff]` read as UTC.
fn epoch_ms(value: &FieldValue) -> Option<f64> {
    match value {
        FieldValue::Integer(v) => Some(*v as f64 * 1000.0),
        FieldValue::Real(v) => Some(v * 1000.0),
        FieldValue::Text(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.timestamp_millis() as f64);
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(naive.and_utc().timestamp_millis() as f64);
            }
            None
        }
        FieldValue::Null => None,
    }
}
