//! Admission pipeline: the synchronous path between an ingest request and
//! its acknowledgement.
//!
//! Order matters: authenticate → rate-limit (headers only, the body is not
//! read yet) → idempotency replay → caps → schema validation → masking →
//! normalization → WAL append. The first failing step short-circuits with
//! its mapped status; a 202 means the batch is already durable.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use crate::auth::{RateLimiter, TokenIdentity, TokenRegistry};
use crate::error::GatewayError;
use crate::masking::MaskingEngine;
use crate::metrics::Metrics;
use crate::model::{
    check_batch_caps, normalize, validate_entry, IngestBatch, NormalizedRecord,
    MAX_BATCH_BYTES, MAX_IDEMPOTENCY_KEY_CHARS,
};
use crate::wal::WalManager;
use crate::{DEDUPE_CACHE_ENTRIES, DEDUPE_WINDOW_SECS};

/// The 202 body; replayed verbatim for idempotent retries.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct IngestAck {
    pub accepted: usize,
    pub segment_seq: u64,
}

pub struct AdmissionPipeline {
    registry: Arc<TokenRegistry>,
    limiter: RateLimiter,
    masking: MaskingEngine,
    wal: Arc<WalManager>,
    metrics: Arc<Metrics>,
    dedupe: StdMutex<LruCache<(String, String), (Instant, IngestAck)>>,
}

impl AdmissionPipeline {
    pub fn new(
        registry: Arc<TokenRegistry>,
        limiter: RateLimiter,
        masking: MaskingEngine,
        wal: Arc<WalManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let cap = NonZeroUsize::new(DEDUPE_CACHE_ENTRIES).unwrap_or(NonZeroUsize::MIN);
        Self {
            registry,
            limiter,
            masking,
            wal,
            metrics,
            dedupe: StdMutex::new(LruCache::new(cap)),
        }
    }

    /// Header-only admission: authentication and rate limiting. Runs before
    /// the request body is read, so a throttled caller costs no body I/O.
    pub fn admit(&self, authorization: Option<&str>) -> Result<TokenIdentity, GatewayError> {
        let identity = self.registry.authenticate(authorization)?;
        if let Err(err) = self.limiter.check(&identity.token) {
            self.metrics
                .rate_limit_exceeded_total
                .with_label_values(&[&identity.name])
                .inc();
            return Err(err);
        }
        Ok(identity)
    }

    /// Body phase: validate, mask, normalize, append, acknowledge.
    pub async fn ingest(
        &self,
        identity: &TokenIdentity,
        idempotency_key: Option<&str>,
        body: &[u8],
    ) -> Result<IngestAck, GatewayError> {
        if let Some(key) = idempotency_key {
            if key.chars().count() > MAX_IDEMPOTENCY_KEY_CHARS {
                return Err(GatewayError::SchemaInvalid(format!(
                    "idempotency key exceeds {MAX_IDEMPOTENCY_KEY_CHARS} chars"
                )));
            }
            if let Some(ack) = self.replay(identity, key) {
                debug!(tenant = %identity.name, key, "replaying deduped acknowledgement");
                return Ok(ack);
            }
        }

        let ack = match self.process(identity, body).await {
            Ok(ack) => ack,
            Err(err) => {
                self.metrics
                    .logs_rejected_total
                    .with_label_values(&[&identity.name, err.code()])
                    .inc();
                return Err(err);
            }
        };

        if let Some(key) = idempotency_key {
            self.remember(identity, key, ack);
        }
        Ok(ack)
    }

    async fn process(
        &self,
        identity: &TokenIdentity,
        body: &[u8],
    ) -> Result<IngestAck, GatewayError> {
        if body.len() > MAX_BATCH_BYTES {
            return Err(GatewayError::TooLarge(format!(
                "batch is {} bytes, limit is {MAX_BATCH_BYTES}",
                body.len()
            )));
        }
        let batch: IngestBatch = serde_json::from_slice(body)
            .map_err(|e| GatewayError::SchemaInvalid(e.to_string()))?;
        check_batch_caps(&batch, body.len())?;

        // One receipt instant for the whole batch.
        let now = Utc::now();
        let ingest_time = now.timestamp_millis();

        let mut records: Vec<NormalizedRecord> = Vec::with_capacity(batch.entries.len());
        for entry in batch.entries {
            let valid = validate_entry(entry, now)?;
            let metadata = match valid.entry.metadata.clone() {
                Some(mut metadata) => {
                    let report = self.masking.mask(&identity.token, &mut metadata);
                    if report.overrides_failed {
                        self.metrics.masking_errors_total.inc();
                    }
                    Some(metadata)
                }
                None => None,
            };
            records.push(normalize(&valid, metadata, ingest_time));
        }

        let ack = self.wal.append(identity, &records).await?;
        self.metrics
            .logs_ingested_total
            .with_label_values(&[&identity.name])
            .inc_by(ack.count as u64);
        self.metrics.batch_size_entries.observe(ack.count as f64);

        Ok(IngestAck {
            accepted: ack.count,
            segment_seq: ack.segment_seq,
        })
    }

    fn replay(&self, identity: &TokenIdentity, key: &str) -> Option<IngestAck> {
        let cache_key = (identity.safe_name.clone(), key.to_string());
        let mut dedupe = self
            .dedupe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some((at, ack)) = dedupe.get(&cache_key) {
            if at.elapsed() < Duration::from_secs(DEDUPE_WINDOW_SECS) {
                return Some(*ack);
            }
        }
        // Either absent or past the window; drop any stale entry.
        dedupe.pop(&cache_key);
        None
    }

    fn remember(&self, identity: &TokenIdentity, key: &str, ack: IngestAck) {
        let mut dedupe = self
            .dedupe
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        dedupe.put(
            (identity.safe_name.clone(), key.to_string()),
            (Instant::now(), ack),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeyEntry, Settings, SharedSettings};
    use serde_json::json;

    fn pipeline_with(root: &std::path::Path, tune: impl FnOnce(&mut Settings)) -> AdmissionPipeline {
        let mut settings = Settings::default();
        settings.wal.root_path = root.to_path_buf();
        settings.security.api_keys.insert(
            "tok-a".to_string(),
            ApiKeyEntry {
                name: "team-a".to_string(),
                active: true,
            },
        );
        tune(&mut settings);
        let shared = SharedSettings::new(settings, None);
        let metrics = Metrics::new().unwrap();
        let wal = WalManager::new(shared.clone(), metrics.clone());
        wal.recover().unwrap();
        AdmissionPipeline::new(
            Arc::new(TokenRegistry::new(shared.clone())),
            RateLimiter::new(shared.clone()),
            MaskingEngine::new(shared),
            wal,
            metrics,
        )
    }

    fn body(entries: serde_json::Value) -> Vec<u8> {
        json!({ "entries": entries }).to_string().into_bytes()
    }

    fn one_entry() -> serde_json::Value {
        json!([{
            "timestamp": Utc::now().to_rfc3339(),
            "level": "INFO",
            "message": "hello",
            "service": "svc",
            "env": "dev",
            "metadata": {"password": "hunter2"}
        }])
    }

    #[tokio::test]
    async fn happy_path_returns_ack() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        let identity = pipeline.admit(Some("Bearer tok-a")).unwrap();
        let ack = pipeline
            .ingest(&identity, None, &body(one_entry()))
            .await
            .unwrap();
        assert_eq!(ack.accepted, 1);
        assert_eq!(ack.segment_seq, 1);
    }

    #[tokio::test]
    async fn unauthenticated_is_rejected_before_body() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        assert!(matches!(
            pipeline.admit(Some("Bearer wrong")),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn rate_limit_second_request() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |s| {
            s.security.rate_limit_rps = 1;
            s.security.rate_limit_burst = 1;
        });
        pipeline.admit(Some("Bearer tok-a")).unwrap();
        assert!(matches!(
            pipeline.admit(Some("Bearer tok-a")),
            Err(GatewayError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn schema_error_rejects_batch() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        let identity = pipeline.admit(Some("Bearer tok-a")).unwrap();
        let err = pipeline
            .ingest(&identity, None, b"{\"entries\": [{\"level\": \"INFO\"}]}")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn masking_applies_before_the_wal_write() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        let identity = pipeline.admit(Some("Bearer tok-a")).unwrap();
        pipeline
            .ingest(&identity, None, &body(one_entry()))
            .await
            .unwrap();

        pipeline.wal.seal(None, false).await;
        let sealed = pipeline.wal.list_sealed(&identity.safe_name);
        let (record, _) = pipeline
            .wal
            .open_reader(&sealed[0])
            .unwrap()
            .next()
            .unwrap();
        assert!(record.line.contains(r#""password":"****""#));
        assert!(!record.line.contains("hunter2"));
    }

    #[tokio::test]
    async fn idempotency_replays_original_ack() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        let identity = pipeline.admit(Some("Bearer tok-a")).unwrap();

        let first = pipeline
            .ingest(&identity, Some("req-1"), &body(one_entry()))
            .await
            .unwrap();
        let replay = pipeline
            .ingest(&identity, Some("req-1"), &body(one_entry()))
            .await
            .unwrap();
        assert_eq!(first.segment_seq, replay.segment_seq);
        assert_eq!(first.accepted, replay.accepted);
        // Only one copy of the record reached the WAL.
        assert_eq!(
            pipeline
                .metrics
                .logs_ingested_total
                .with_label_values(&["team-a"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn oversized_idempotency_key_is_schema_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        let identity = pipeline.admit(Some("Bearer tok-a")).unwrap();
        let key = "k".repeat(129);
        let err = pipeline
            .ingest(&identity, Some(&key), &body(one_entry()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::SchemaInvalid(_)));
    }

    #[tokio::test]
    async fn rejection_reasons_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline_with(dir.path(), |_| {});
        let identity = pipeline.admit(Some("Bearer tok-a")).unwrap();
        let _ = pipeline.ingest(&identity, None, b"not json").await;
        assert_eq!(
            pipeline
                .metrics
                .logs_rejected_total
                .with_label_values(&["team-a", "SCHEMA_INVALID"])
                .get(),
            1
        );
    }
}
