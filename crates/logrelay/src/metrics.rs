//! Prometheus metrics for the gateway.
//!
//! All series live in one registry owned by [`Metrics`]; the `/metrics`
//! handler encodes it in text exposition format. Token-labeled series use
//! the registry name of the key, never the bearer secret.

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

const REQUEST_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
const APPEND_BUCKETS: &[f64] = &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 1.0];
const PUSH_BUCKETS: &[f64] = &[0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];
const SEGMENT_SIZE_BUCKETS: &[f64] = &[
    1024.0,
    16384.0,
    65536.0,
    262144.0,
    1048576.0,
    4194304.0,
    16777216.0,
    67108864.0,
    134217728.0,
];
const BATCH_SIZE_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0];

pub struct Metrics {
    registry: Registry,

    pub logs_ingested_total: IntCounterVec,
    pub logs_rejected_total: IntCounterVec,
    pub rate_limit_exceeded_total: IntCounterVec,
    pub wal_segments_created_total: IntCounterVec,
    pub wal_segments_forwarded_total: IntCounterVec,
    pub forwarder_poison_total: IntCounterVec,
    pub quota_evicted_total: IntCounterVec,
    pub wal_backpressure_total: IntCounterVec,
    pub masking_errors_total: IntCounter,
    pub segments_corrupt_total: IntCounter,

    pub wal_segments_active: IntGaugeVec,
    pub wal_disk_usage_bytes: IntGaugeVec,
    pub disk_free_ratio: Gauge,

    pub http_request_duration_seconds: HistogramVec,
    pub wal_append_duration_seconds: Histogram,
    pub forwarder_push_duration_seconds: Histogram,
    pub segment_size_bytes: Histogram,
    pub batch_size_entries: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, MetricsError> {
        let registry = Registry::new();

        let logs_ingested_total = IntCounterVec::new(
            Opts::new("logs_ingested_total", "Log entries durably accepted"),
            &["token"],
        )?;
        registry.register(Box::new(logs_ingested_total.clone()))?;

        let logs_rejected_total = IntCounterVec::new(
            Opts::new("logs_rejected_total", "Log entries rejected at admission"),
            &["token", "reason"],
        )?;
        registry.register(Box::new(logs_rejected_total.clone()))?;

        let rate_limit_exceeded_total = IntCounterVec::new(
            Opts::new("rate_limit_exceeded_total", "Requests rejected by the rate limiter"),
            &["token"],
        )?;
        registry.register(Box::new(rate_limit_exceeded_total.clone()))?;

        let wal_segments_created_total = IntCounterVec::new(
            Opts::new("wal_segments_created_total", "WAL segments created"),
            &["token", "reason"],
        )?;
        registry.register(Box::new(wal_segments_created_total.clone()))?;

        let wal_segments_forwarded_total = IntCounterVec::new(
            Opts::new(
                "wal_segments_forwarded_total",
                "WAL segments fully delivered to the sink and deleted",
            ),
            &["token"],
        )?;
        registry.register(Box::new(wal_segments_forwarded_total.clone()))?;

        let forwarder_poison_total = IntCounterVec::new(
            Opts::new(
                "forwarder_poison_total",
                "Segments dropped because the sink permanently refused them",
            ),
            &["token"],
        )?;
        registry.register(Box::new(forwarder_poison_total.clone()))?;

        let quota_evicted_total = IntCounterVec::new(
            Opts::new(
                "quota_evicted_total",
                "Sealed segments evicted to enforce tenant quotas",
            ),
            &["token"],
        )?;
        registry.register(Box::new(quota_evicted_total.clone()))?;

        let wal_backpressure_total = IntCounterVec::new(
            Opts::new(
                "wal_backpressure_total",
                "Appends refused with soft-quota backpressure",
            ),
            &["token"],
        )?;
        registry.register(Box::new(wal_backpressure_total.clone()))?;

        let masking_errors_total = IntCounter::new(
            "masking_errors_total",
            "Records masked with baseline-only rules after an override failure",
        )?;
        registry.register(Box::new(masking_errors_total.clone()))?;

        let segments_corrupt_total = IntCounter::new(
            "segments_corrupt_total",
            "Segments skipped for bad headers or invalid framing",
        )?;
        registry.register(Box::new(segments_corrupt_total.clone()))?;

        let wal_segments_active = IntGaugeVec::new(
            Opts::new("wal_segments_active", "Active (writable) segments per tenant"),
            &["token"],
        )?;
        registry.register(Box::new(wal_segments_active.clone()))?;

        let wal_disk_usage_bytes = IntGaugeVec::new(
            Opts::new("wal_disk_usage_bytes", "Bytes on disk per tenant"),
            &["token"],
        )?;
        registry.register(Box::new(wal_disk_usage_bytes.clone()))?;

        let disk_free_ratio = Gauge::new("disk_free_ratio", "Free space ratio of the WAL volume")?;
        registry.register(Box::new(disk_free_ratio.clone()))?;

        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request latency")
                .buckets(REQUEST_BUCKETS.to_vec()),
            &["method", "path"],
        )?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;

        let wal_append_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "wal_append_duration_seconds",
                "WAL append latency including fsync",
            )
            .buckets(APPEND_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(wal_append_duration_seconds.clone()))?;

        let forwarder_push_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("forwarder_push_duration_seconds", "Sink push latency")
                .buckets(PUSH_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(forwarder_push_duration_seconds.clone()))?;

        let segment_size_bytes = Histogram::with_opts(
            HistogramOpts::new("segment_size_bytes", "Segment size at seal time")
                .buckets(SEGMENT_SIZE_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(segment_size_bytes.clone()))?;

        let batch_size_entries = Histogram::with_opts(
            HistogramOpts::new("batch_size_entries", "Entries per accepted batch")
                .buckets(BATCH_SIZE_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(batch_size_entries.clone()))?;

        Ok(Arc::new(Self {
            registry,
            logs_ingested_total,
            logs_rejected_total,
            rate_limit_exceeded_total,
            wal_segments_created_total,
            wal_segments_forwarded_total,
            forwarder_poison_total,
            quota_evicted_total,
            wal_backpressure_total,
            masking_errors_total,
            segments_corrupt_total,
            wal_segments_active,
            wal_disk_usage_bytes,
            disk_free_ratio,
            http_request_duration_seconds,
            wal_append_duration_seconds,
            forwarder_push_duration_seconds,
            segment_size_bytes,
            batch_size_entries,
        }))
    }

    /// Text exposition for `GET /metrics`.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
