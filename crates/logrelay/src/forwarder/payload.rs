//! Loki push payload assembly.
//!
//! Records are grouped into streams by exact label-set equality; values are
//! `["<unix_ns>", "<line>"]` pairs sorted ascending by timestamp. A builder
//! enforces the sink's per-push limits (value count and approximate payload
//! bytes) so one segment can span several pushes and several small segments
//! can share one.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::model::{line_timestamp_ns, NormalizedRecord};

/// Rough serialization overhead per value beyond the line itself: the
/// nanosecond timestamp string plus JSON punctuation.
const VALUE_OVERHEAD: usize = 32;
/// Rough per-stream overhead for its label object.
const STREAM_OVERHEAD: usize = 64;

#[derive(Debug, Serialize)]
pub struct LokiStream {
    pub stream: BTreeMap<String, String>,
    pub values: Vec<(String, String)>,
}

/// The `POST /loki/api/v1/push` body.
#[derive(Debug, Serialize)]
pub struct PushRequest {
    pub streams: Vec<LokiStream>,
}

pub struct PayloadBuilder {
    max_values: usize,
    max_bytes: usize,
    streams: BTreeMap<BTreeMap<String, String>, Vec<(i64, String)>>,
    value_count: usize,
    byte_estimate: usize,
}

impl PayloadBuilder {
    pub fn new(max_values: usize, max_bytes: usize) -> Self {
        Self {
            max_values: max_values.max(1),
            max_bytes: max_bytes.max(1),
            streams: BTreeMap::new(),
            value_count: 0,
            byte_estimate: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value_count == 0
    }

    pub fn value_count(&self) -> usize {
        self.value_count
    }

    /// Add one record unless it would blow a cap. The first record is always
    /// accepted so an oversized single record cannot wedge the drain.
    pub fn try_add(&mut self, record: &NormalizedRecord) -> bool {
        let label_cost = if self.streams.contains_key(&record.labels) {
            0
        } else {
            record
                .labels
                .iter()
                .map(|(k, v)| k.len() + v.len() + 6)
                .sum::<usize>()
                + STREAM_OVERHEAD
        };
        let cost = record.line.len() + VALUE_OVERHEAD + label_cost;

        if !self.is_empty()
            && (self.value_count + 1 > self.max_values
                || self.byte_estimate + cost > self.max_bytes)
        {
            return false;
        }

        let ts_ns = line_timestamp_ns(&record.line)
            .unwrap_or_else(|| record.ingest_time.saturating_mul(1_000_000));
        self.streams
            .entry(record.labels.clone())
            .or_default()
            .push((ts_ns, record.line.clone()));
        self.value_count += 1;
        self.byte_estimate += cost;
        true
    }

    pub fn finish(self) -> Option<PushRequest> {
        if self.value_count == 0 {
            return None;
        }
        let streams = self
            .streams
            .into_iter()
            .map(|(labels, mut values)| {
                values.sort_by_key(|(ts, _)| *ts);
                LokiStream {
                    stream: labels,
                    values: values
                        .into_iter()
                        .map(|(ts, line)| (ts.to_string(), line))
                        .collect(),
                }
            })
            .collect();
        Some(PushRequest { streams })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(service: &str, ts: &str, message: &str) -> NormalizedRecord {
        let mut labels = BTreeMap::new();
        labels.insert("service".to_string(), service.to_string());
        labels.insert("env".to_string(), "dev".to_string());
        labels.insert("level".to_string(), "INFO".to_string());
        NormalizedRecord {
            labels,
            line: format!(r#"{{"message":"{message}","timestamp":"{ts}"}}"#),
            ingest_time: 42,
        }
    }

    #[test]
    fn groups_by_exact_label_set() {
        let mut builder = PayloadBuilder::new(100, 1 << 20);
        assert!(builder.try_add(&record("a", "2025-01-01T00:00:00.000Z", "1")));
        assert!(builder.try_add(&record("b", "2025-01-01T00:00:01.000Z", "2")));
        assert!(builder.try_add(&record("a", "2025-01-01T00:00:02.000Z", "3")));

        let push = builder.finish().unwrap();
        assert_eq!(push.streams.len(), 2);
        let stream_a = push
            .streams
            .iter()
            .find(|s| s.stream["service"] == "a")
            .unwrap();
        assert_eq!(stream_a.values.len(), 2);
    }

    #[test]
    fn values_sorted_by_timestamp() {
        let mut builder = PayloadBuilder::new(100, 1 << 20);
        builder.try_add(&record("a", "2025-01-01T00:00:05.000Z", "late"));
        builder.try_add(&record("a", "2025-01-01T00:00:01.000Z", "early"));

        let push = builder.finish().unwrap();
        let values = &push.streams[0].values;
        assert!(values[0].1.contains("early"));
        assert!(values[1].1.contains("late"));
        assert!(values[0].0.parse::<i64>().unwrap() < values[1].0.parse::<i64>().unwrap());
    }

    #[test]
    fn value_count_cap() {
        let mut builder = PayloadBuilder::new(2, 1 << 20);
        assert!(builder.try_add(&record("a", "2025-01-01T00:00:00.000Z", "1")));
        assert!(builder.try_add(&record("a", "2025-01-01T00:00:01.000Z", "2")));
        assert!(!builder.try_add(&record("a", "2025-01-01T00:00:02.000Z", "3")));
        assert_eq!(builder.value_count(), 2);
    }

    #[test]
    fn byte_cap_but_first_record_always_fits() {
        let mut builder = PayloadBuilder::new(100, 64);
        let big = record("a", "2025-01-01T00:00:00.000Z", &"x".repeat(500));
        assert!(builder.try_add(&big));
        assert!(!builder.try_add(&record("a", "2025-01-01T00:00:01.000Z", "small")));
        assert_eq!(builder.finish().unwrap().streams[0].values.len(), 1);
    }

    #[test]
    fn timestamp_falls_back_to_ingest_time() {
        let mut labels = BTreeMap::new();
        labels.insert("service".to_string(), "a".to_string());
        let odd = NormalizedRecord {
            labels,
            line: "plain text, not our json".to_string(),
            ingest_time: 1_700_000_000_000,
        };
        let mut builder = PayloadBuilder::new(10, 1 << 20);
        builder.try_add(&odd);
        let push = builder.finish().unwrap();
        assert_eq!(push.streams[0].values[0].0, "1700000000000000000");
    }

    #[test]
    fn empty_builder_finishes_to_none() {
        assert!(PayloadBuilder::new(10, 10).finish().is_none());
    }

    #[test]
    fn serializes_to_loki_wire_shape() {
        let mut builder = PayloadBuilder::new(10, 1 << 20);
        builder.try_add(&record("api", "2025-01-01T00:00:00.000Z", "hello"));
        let push = builder.finish().unwrap();
        let json = serde_json::to_value(&push).unwrap();
        assert!(json["streams"][0]["stream"]["service"] == "api");
        assert!(json["streams"][0]["values"][0][0].is_string());
        assert!(json["streams"][0]["values"][0][1]
            .as_str()
            .unwrap()
            .contains("hello"));
    }
}
