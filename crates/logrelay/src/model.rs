//! Ingest data model: validation and normalization.
//!
//! `LogEntry`/`IngestBatch` are the client-facing shapes; unknown top-level
//! fields are dropped during deserialization. Validation enforces the schema
//! constraints and produces canonical values (uppercase level, parsed
//! timestamp). Normalization turns a validated entry into the
//! [`NormalizedRecord`] stored in the WAL: the label subset plus
//! service/env/level, and a compact `line` serialized with sorted keys so
//! equal records hash equally.

use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

pub const MAX_MESSAGE_BYTES: usize = 32 * 1024;
pub const MAX_NAME_CHARS: usize = 64;
pub const MAX_ID_CHARS: usize = 128;
pub const MAX_LABELS: usize = 6;
pub const MAX_LABEL_VALUE_CHARS: usize = 64;
pub const MAX_BATCH_ENTRIES: usize = 500;
pub const MAX_BATCH_BYTES: usize = 1024 * 1024;
pub const MAX_IDEMPOTENCY_KEY_CHARS: usize = 128;

/// Label keys clients may set; everything else is rejected.
pub const ALLOWED_LABEL_KEYS: [&str; 6] =
    ["service", "env", "level", "schema_version", "region", "tenant"];

/// Deepest allowed nesting inside `metadata`. Bounds the recursion of
/// everything that later walks the tree (masking, serialization).
pub const MAX_METADATA_DEPTH: usize = 5;

const LEVELS: [&str; 5] = ["DEBUG", "INFO", "WARN", "ERROR", "FATAL"];

/// Newest acceptable timestamp: 24h into the future.
const MAX_FUTURE_HOURS: i64 = 24;
/// Oldest acceptable timestamp: 14 days into the past.
const MAX_PAST_DAYS: i64 = 14;

fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("name pattern compiles"))
}

/// One client-supplied log entry, pre-validation.
#[derive(Debug, Clone, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub service: String,
    pub env: String,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub span_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// The ingest request body.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestBatch {
    pub entries: Vec<LogEntry>,
}

/// An entry that passed validation, with canonical timestamp and level.
#[derive(Debug, Clone)]
pub struct ValidEntry {
    pub entry: LogEntry,
    pub timestamp: DateTime<Utc>,
    pub level: &'static str,
}

/// What the WAL stores: one frame payload per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub labels: BTreeMap<String, String>,
    pub line: String,
    /// Server receipt instant, unix milliseconds, stamped once per batch.
    pub ingest_time: i64,
}

/// Reject batches over the entry/byte caps. `raw_len` is the serialized
/// request body size.
pub fn check_batch_caps(batch: &IngestBatch, raw_len: usize) -> Result<(), GatewayError> {
    if batch.entries.is_empty() {
        return Err(GatewayError::SchemaInvalid(
            "batch must contain at least one entry".to_string(),
        ));
    }
    if batch.entries.len() > MAX_BATCH_ENTRIES {
        return Err(GatewayError::TooLarge(format!(
            "batch has {} entries, limit is {MAX_BATCH_ENTRIES}",
            batch.entries.len()
        )));
    }
    if raw_len > MAX_BATCH_BYTES {
        return Err(GatewayError::TooLarge(format!(
            "batch is {raw_len} bytes, limit is {MAX_BATCH_BYTES}"
        )));
    }
    Ok(())
}

/// Validate one entry against the schema, returning canonical values.
pub fn validate_entry(entry: LogEntry, now: DateTime<Utc>) -> Result<ValidEntry, GatewayError> {
    let timestamp = DateTime::parse_from_rfc3339(&entry.timestamp)
        .map_err(|e| schema(format!("timestamp '{}': {e}", entry.timestamp)))?
        .with_timezone(&Utc);

    if timestamp > now + Duration::hours(MAX_FUTURE_HOURS) {
        return Err(schema(format!(
            "timestamp {timestamp} is more than {MAX_FUTURE_HOURS}h in the future"
        )));
    }
    if timestamp < now - Duration::days(MAX_PAST_DAYS) {
        return Err(schema(format!(
            "timestamp {timestamp} is more than {MAX_PAST_DAYS}d in the past"
        )));
    }

    let upper = entry.level.to_uppercase();
    let level = LEVELS
        .iter()
        .find(|l| **l == upper)
        .copied()
        .ok_or_else(|| schema(format!("level '{}' is not one of {LEVELS:?}", entry.level)))?;

    if entry.message.is_empty() {
        return Err(schema("message must not be empty".to_string()));
    }
    if entry.message.len() > MAX_MESSAGE_BYTES {
        return Err(schema(format!(
            "message is {} bytes, limit is {MAX_MESSAGE_BYTES}",
            entry.message.len()
        )));
    }

    check_name("service", &entry.service)?;
    check_name("env", &entry.env)?;

    if let Some(labels) = &entry.labels {
        if labels.len() > MAX_LABELS {
            return Err(schema(format!(
                "{} labels given, limit is {MAX_LABELS}",
                labels.len()
            )));
        }
        for (key, value) in labels {
            if !ALLOWED_LABEL_KEYS.contains(&key.as_str()) {
                return Err(schema(format!("label key '{key}' is not allowed")));
            }
            if value.chars().count() > MAX_LABEL_VALUE_CHARS {
                return Err(schema(format!(
                    "label '{key}' value exceeds {MAX_LABEL_VALUE_CHARS} chars"
                )));
            }
        }
    }

    for (field, value) in [("trace_id", &entry.trace_id), ("span_id", &entry.span_id)] {
        if let Some(value) = value {
            if value.chars().count() > MAX_ID_CHARS {
                return Err(schema(format!("{field} exceeds {MAX_ID_CHARS} chars")));
            }
        }
    }

    if let Some(metadata) = &entry.metadata {
        check_metadata_depth(metadata, 0)?;
    }

    Ok(ValidEntry {
        entry,
        timestamp,
        level,
    })
}

fn check_metadata_depth(value: &Value, depth: usize) -> Result<(), GatewayError> {
    if depth > MAX_METADATA_DEPTH {
        return Err(schema(format!(
            "metadata nesting exceeds {MAX_METADATA_DEPTH} levels"
        )));
    }
    match value {
        Value::Object(map) => {
            for child in map.values() {
                check_metadata_depth(child, depth + 1)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                check_metadata_depth(item, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn check_name(field: &str, value: &str) -> Result<(), GatewayError> {
    if value.is_empty() {
        return Err(schema(format!("{field} must not be empty")));
    }
    if value.chars().count() > MAX_NAME_CHARS {
        return Err(schema(format!("{field} exceeds {MAX_NAME_CHARS} chars")));
    }
    if !name_pattern().is_match(value) {
        return Err(schema(format!(
            "{field} '{value}' must match [A-Za-z0-9._-]+"
        )));
    }
    Ok(())
}

fn schema(message: String) -> GatewayError {
    GatewayError::SchemaInvalid(message)
}

/// Build the stored record from a validated entry. `metadata` is passed
/// separately because masking has already rewritten it.
pub fn normalize(valid: &ValidEntry, metadata: Option<Value>, ingest_time: i64) -> NormalizedRecord {
    let entry = &valid.entry;

    let mut labels = BTreeMap::new();
    if let Some(extra) = &entry.labels {
        for (key, value) in extra {
            labels.insert(key.clone(), value.clone());
        }
    }
    // Field-derived labels win over client-supplied duplicates.
    labels.insert("service".to_string(), entry.service.clone());
    labels.insert("env".to_string(), entry.env.clone());
    labels.insert("level".to_string(), valid.level.to_string());

    // serde_json's default map is a BTreeMap, so nested keys come out sorted.
    let mut line = serde_json::Map::new();
    line.insert(
        "timestamp".to_string(),
        Value::String(valid.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    line.insert("message".to_string(), Value::String(entry.message.clone()));
    if let Some(trace_id) = &entry.trace_id {
        line.insert("trace_id".to_string(), Value::String(trace_id.clone()));
    }
    if let Some(span_id) = &entry.span_id {
        line.insert("span_id".to_string(), Value::String(span_id.clone()));
    }
    if let Some(metadata) = metadata {
        line.insert("metadata".to_string(), metadata);
    }

    NormalizedRecord {
        labels,
        line: Value::Object(line).to_string(),
        ingest_time,
    }
}

/// Parse a stored line's timestamp into unix nanoseconds for the sink
/// payload. Falls back to `None` if the line is not what we wrote.
pub fn line_timestamp_ns(line: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(line).ok()?;
    let ts = value.get("timestamp")?.as_str()?;
    let parsed = DateTime::parse_from_rfc3339(ts).ok()?;
    parsed.timestamp_nanos_opt()
}
