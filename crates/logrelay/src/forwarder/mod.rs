//! Background forwarder: drains sealed WAL segments into the sink.
//!
//! One cooperative scheduler services every tenant round-robin, at most one
//! push per tenant per turn, so a hot tenant cannot starve the rest. Each
//! tenant moves through a small state machine:
//!
//! ```text
//!   Idle ──seal──▶ Draining ──2xx──▶ Draining / Idle
//!                     │
//!                 429/5xx/net
//!                     ▼
//!               Backoff(n) ──schedule exhausted──▶ Parked ──▶ Backoff(0)
//! ```
//!
//! Success deletes every segment fully covered by the acknowledged push.
//! A non-429 4xx is poison: the data can never be accepted, so the
//! segment is dropped and counted. Large segments drain across turns via an
//! in-memory cursor; a restart forgets the cursor and re-sends, which the
//! at-least-once contract allows.

pub mod payload;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SharedSettings;
use crate::metrics::Metrics;
use crate::wal::{SegmentHandle, WalManager};
use payload::{PayloadBuilder, PushRequest};

/// Where a tenant's drain currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantPhase {
    Idle,
    Draining,
    Backoff(u32),
    Parked,
}

impl TenantPhase {
    pub fn name(self) -> String {
        match self {
            TenantPhase::Idle => "idle".to_string(),
            TenantPhase::Draining => "draining".to_string(),
            TenantPhase::Backoff(n) => format!("backoff({n})"),
            TenantPhase::Parked => "parked".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DrainCursor {
    seq: u64,
    records_done: usize,
}

#[derive(Debug)]
struct TenantDrain {
    phase: TenantPhase,
    not_before: Option<Instant>,
    cursor: Option<DrainCursor>,
    failures: u32,
}

impl Default for TenantDrain {
    fn default() -> Self {
        Self {
            phase: TenantPhase::Idle,
            not_before: None,
            cursor: None,
            failures: 0,
        }
    }
}

enum PushOutcome {
    Success,
    Poison(StatusCode),
    Transient {
        retry_after: Option<Duration>,
        detail: String,
    },
}

/// How far the builder got through one segment.
struct SegmentProgress {
    handle: SegmentHandle,
    records_done: usize,
    exhausted: bool,
}

pub struct Forwarder {
    settings: Arc<SharedSettings>,
    wal: Arc<WalManager>,
    metrics: Arc<Metrics>,
    client: reqwest::Client,
    states: StdMutex<HashMap<String, TenantDrain>>,
    cancel: CancellationToken,
    last_progress: StdMutex<Instant>,
}

impl Forwarder {
    pub fn new(
        settings: Arc<SharedSettings>,
        wal: Arc<WalManager>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let timeout = settings.snapshot().loki.timeout_seconds;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout.max(1)))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            settings,
            wal,
            metrics,
            client,
            states: StdMutex::new(HashMap::new()),
            cancel,
            last_progress: StdMutex::new(Instant::now()),
        })
    }

    /// Scheduler loop. Wakes on segment seals or the global tick; visits
    /// tenants round-robin and services each due tenant with one push.
    pub async fn run(self: Arc<Self>) {
        info!("forwarder started");
        let notify = self.wal.seal_notifier();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.touch_progress();

            for tenant in self.wal.tenant_names() {
                if self.cancel.is_cancelled() {
                    return;
                }
                if !self.due(&tenant) {
                    continue;
                }
                self.service_tenant(&tenant).await;
            }

            let tick = Duration::from_secs(self.settings.snapshot().loki.tick_seconds.max(1));
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = notify.notified() => {}
                () = tokio::time::sleep(tick) => {}
            }
        }
        info!("forwarder stopped");
    }

    /// Seconds since the scheduler last completed a pass; readiness treats a
    /// wedged loop as unhealthy.
    pub fn progress_age(&self) -> Duration {
        self.last_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .elapsed()
    }

    /// Per-tenant phase names, keyed by WAL directory name.
    pub fn phases(&self) -> HashMap<String, String> {
        let states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states
            .iter()
            .map(|(tenant, drain)| (tenant.clone(), drain.phase.name()))
            .collect()
    }

    fn touch_progress(&self) {
        let mut last = self
            .last_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *last = Instant::now();
    }

    fn due(&self, tenant: &str) -> bool {
        let states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        states
            .get(tenant)
            .and_then(|drain| drain.not_before)
            .map(|at| Instant::now() >= at)
            .unwrap_or(true)
    }

    fn with_state<R>(&self, tenant: &str, f: impl FnOnce(&mut TenantDrain) -> R) -> R {
        let mut states = self
            .states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(states.entry(tenant.to_string()).or_default())
    }

    /// One turn for one tenant: build at most one push and send it.
    async fn service_tenant(&self, tenant: &str) {
        let sealed = self.wal.list_sealed(tenant);
        if sealed.is_empty() {
            self.with_state(tenant, |drain| {
                drain.phase = TenantPhase::Idle;
                drain.not_before = None;
                drain.cursor = None;
            });
            return;
        }

        let loki = self.settings.snapshot().loki.clone();
        let cursor = self.with_state(tenant, |drain| {
            drain.phase = TenantPhase::Draining;
            // A cursor for a segment that no longer exists (evicted) resets.
            if let Some(cursor) = drain.cursor {
                if sealed.first().map(|s| s.seq) != Some(cursor.seq) {
                    drain.cursor = None;
                }
            }
            drain.cursor
        });

        let mut builder = PayloadBuilder::new(loki.max_values_per_push, loki.max_bytes_per_push);
        let mut progress: Vec<SegmentProgress> = Vec::new();
        let mut payload_full = false;

        for handle in &sealed {
            if payload_full {
                break;
            }
            let iter = match self.wal.open_reader(handle) {
                Ok(iter) => iter,
                Err(err) => {
                    // Unreadable on disk; it can never be delivered. Same
                    // treatment as sink poison so the queue cannot wedge.
                    error!(tenant = %handle.label, seq = handle.seq, "dropping unreadable segment: {err}");
                    self.metrics
                        .forwarder_poison_total
                        .with_label_values(&[&handle.label])
                        .inc();
                    self.wal.delete(handle);
                    continue;
                }
            };

            let skip = match cursor {
                Some(c) if c.seq == handle.seq => c.records_done,
                _ => 0,
            };
            let mut records_done = skip;
            let mut exhausted = true;
            for (i, (record, _offset)) in iter.enumerate() {
                if i < skip {
                    continue;
                }
                if builder.try_add(&record) {
                    records_done += 1;
                } else {
                    exhausted = false;
                    payload_full = true;
                    break;
                }
            }
            progress.push(SegmentProgress {
                handle: handle.clone(),
                records_done,
                exhausted,
            });
        }

        if builder.is_empty() {
            // Only empty (or skipped-to-end) segments this turn; they carry
            // nothing deliverable, so retire them without a push.
            for p in progress.iter().filter(|p| p.exhausted) {
                self.wal.delete(&p.handle);
            }
            self.with_state(tenant, |drain| drain.cursor = None);
            return;
        }

        let Some(push) = builder.finish() else {
            return;
        };
        let value_count = push.streams.iter().map(|s| s.values.len()).sum::<usize>();
        let outcome = self.push(&loki, &push).await;

        match outcome {
            PushOutcome::Success => {
                let mut next_cursor = None;
                for p in &progress {
                    if p.exhausted {
                        debug!(tenant = %p.handle.label, seq = p.handle.seq, "segment delivered");
                        self.metrics
                            .wal_segments_forwarded_total
                            .with_label_values(&[&p.handle.label])
                            .inc();
                        self.wal.delete(&p.handle);
                    } else {
                        next_cursor = Some(DrainCursor {
                            seq: p.handle.seq,
                            records_done: p.records_done,
                        });
                    }
                }
                debug!(tenant, values = value_count, "push acknowledged");
                self.with_state(tenant, |drain| {
                    drain.cursor = next_cursor;
                    drain.failures = 0;
                    drain.not_before = None;
                    drain.phase = TenantPhase::Draining;
                });
                self.touch_progress();
            }
            PushOutcome::Poison(status) => {
                for p in &progress {
                    warn!(
                        tenant = %p.handle.label,
                        seq = p.handle.seq,
                        %status,
                        "sink permanently refused segment, dropping"
                    );
                    self.metrics
                        .forwarder_poison_total
                        .with_label_values(&[&p.handle.label])
                        .inc();
                    self.wal.delete(&p.handle);
                }
                self.with_state(tenant, |drain| {
                    drain.cursor = None;
                    drain.failures = 0;
                    drain.not_before = None;
                    drain.phase = TenantPhase::Draining;
                });
            }
            PushOutcome::Transient {
                retry_after,
                detail,
            } => {
                self.with_state(tenant, |drain| {
                    drain.failures += 1;
                    let schedule = &loki.backoff_seconds;
                    if drain.failures > loki.max_retries.max(1) {
                        // Schedule exhausted; park and restart the ladder.
                        drain.phase = TenantPhase::Parked;
                        drain.failures = 0;
                        drain.not_before =
                            Some(Instant::now() + Duration::from_secs(loki.park_seconds));
                        warn!(tenant, "backoff schedule exhausted, parking: {detail}");
                    } else {
                        let step = (drain.failures - 1) as usize;
                        let base = schedule
                            .get(step.min(schedule.len().saturating_sub(1)))
                            .copied()
                            .unwrap_or(5);
                        let delay = retry_after.unwrap_or_else(|| full_jitter(base));
                        drain.phase = TenantPhase::Backoff(drain.failures - 1);
                        drain.not_before = Some(Instant::now() + delay);
                        warn!(
                            tenant,
                            attempt = drain.failures,
                            delay_ms = delay.as_millis() as u64,
                            "transient push failure: {detail}"
                        );
                    }
                });
            }
        }
    }

    async fn push(&self, loki: &crate::config::LokiSettings, payload: &PushRequest) -> PushOutcome {
        let started = Instant::now();
        let mut request = self.client.post(loki.push_url()).json(payload);
        if let Some(bearer) = &loki.bearer_token {
            request = request.bearer_auth(bearer);
        }
        let response = request.send().await;
        self.metrics
            .forwarder_push_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    PushOutcome::Success
                } else if status == StatusCode::TOO_MANY_REQUESTS {
                    let retry_after = resp
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs);
                    PushOutcome::Transient {
                        retry_after,
                        detail: format!("sink responded {status}"),
                    }
                } else if status.is_client_error() {
                    PushOutcome::Poison(status)
                } else {
                    PushOutcome::Transient {
                        retry_after: None,
                        detail: format!("sink responded {status}"),
                    }
                }
            }
            Err(err) => PushOutcome::Transient {
                retry_after: None,
                detail: err.to_string(),
            },
        }
    }
}

/// Uniform random delay in `(0, base]` seconds.
fn full_jitter(base_secs: u64) -> Duration {
    let base_ms = base_secs.saturating_mul(1000).max(1);
    Duration::from_millis(rand::thread_rng().gen_range(1..=base_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names() {
        assert_eq!(TenantPhase::Idle.name(), "idle");
        assert_eq!(TenantPhase::Draining.name(), "draining");
        assert_eq!(TenantPhase::Backoff(2).name(), "backoff(2)");
        assert_eq!(TenantPhase::Parked.name(), "parked");
    }

    #[test]
    fn full_jitter_stays_in_range() {
        for _ in 0..100 {
            let d = full_jitter(5);
            assert!(d > Duration::ZERO);
            assert!(d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn default_drain_is_idle_and_due() {
        let drain = TenantDrain::default();
        assert_eq!(drain.phase, TenantPhase::Idle);
        assert!(drain.not_before.is_none());
        assert!(drain.cursor.is_none());
    }
}
