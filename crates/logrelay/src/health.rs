//! Liveness and readiness.
//!
//! Liveness is unconditional: if the process answers, it is alive.
//! Readiness composes four probes; all must hold or `/readyz` returns 503
//! with the failing probes listed:
//! - the sink answered its ready endpoint with 2xx within the last 60 s
//!   (a background prober pings every 15 s),
//! - the WAL volume has at least the configured free-space ratio,
//! - the WAL root is writable, recovery succeeded, and durable writes have
//!   not been failing for more than 30 s,
//! - the forwarder loop made a pass within the last 60 s.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SharedSettings;
use crate::error::GatewayError;
use crate::forwarder::Forwarder;
use crate::wal::WalManager;

/// Sink probe cadence.
const PROBE_INTERVAL: Duration = Duration::from_secs(15);
/// How recent the last sink 2xx must be.
const SINK_FRESHNESS: Duration = Duration::from_secs(60);
/// How long durable-write failures are tolerated before readiness flips.
const DURABILITY_GRACE: Duration = Duration::from_secs(30);
/// How stale the forwarder loop may be before it counts as wedged.
const FORWARDER_STALL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub name: &'static str,
    pub healthy: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub ready: bool,
    pub probes: Vec<ProbeStatus>,
}

pub struct Health {
    settings: Arc<SharedSettings>,
    wal: Arc<WalManager>,
    forwarder: Arc<Forwarder>,
    client: reqwest::Client,
    last_sink_ok: StdMutex<Option<Instant>>,
}

impl Health {
    pub fn new(
        settings: Arc<SharedSettings>,
        wal: Arc<WalManager>,
        forwarder: Arc<Forwarder>,
    ) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            settings,
            wal,
            forwarder,
            client,
            last_sink_ok: StdMutex::new(None),
        })
    }

    /// Background loop pinging the sink's ready endpoint.
    pub async fn run_prober(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.probe_sink_once().await;
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(PROBE_INTERVAL) => {}
            }
        }
    }

    pub async fn probe_sink_once(&self) {
        let loki = self.settings.snapshot().loki.clone();
        let mut request = self.client.get(loki.ready_url());
        if let Some(bearer) = &loki.bearer_token {
            request = request.bearer_auth(bearer);
        }
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                let mut last = self
                    .last_sink_ok
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *last = Some(Instant::now());
                debug!("sink ready probe ok");
            }
            Ok(resp) => warn!(status = %resp.status(), "sink ready probe failed"),
            Err(err) => warn!("sink ready probe unreachable: {err}"),
        }
    }

    fn sink_fresh(&self) -> Option<Duration> {
        self.last_sink_ok
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .map(|at| at.elapsed())
    }

    fn wal_root_writable(&self) -> Result<(), String> {
        let probe = self.wal.root_path().join(".readyz-probe");
        std::fs::write(&probe, b"ok").map_err(|e| e.to_string())?;
        std::fs::remove_file(&probe).map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Full readiness decision for `/readyz`.
    pub fn readiness(&self) -> ReadinessReport {
        let min_ratio = self.settings.snapshot().wal.disk_free_min_ratio;
        let mut probes = Vec::with_capacity(4);

        let sink_age = self.sink_fresh();
        let sink_ok = sink_age.map(|age| age <= SINK_FRESHNESS).unwrap_or(false);
        probes.push(ProbeStatus {
            name: "sink",
            healthy: sink_ok,
            detail: match sink_age {
                Some(age) => format!("last 2xx {}s ago", age.as_secs()),
                None => "no successful probe yet".to_string(),
            },
        });

        let ratio = self.wal.disk_free_ratio();
        probes.push(ProbeStatus {
            name: "disk",
            healthy: ratio >= min_ratio,
            detail: format!("free ratio {ratio:.2}, minimum {min_ratio:.2}"),
        });

        let (wal_ok, wal_detail) = self.wal_probe();
        probes.push(ProbeStatus {
            name: "wal",
            healthy: wal_ok,
            detail: wal_detail,
        });

        let progress_age = self.forwarder.progress_age();
        probes.push(ProbeStatus {
            name: "forwarder",
            healthy: progress_age <= FORWARDER_STALL,
            detail: format!("last pass {}s ago", progress_age.as_secs()),
        });

        ReadinessReport {
            ready: probes.iter().all(|p| p.healthy),
            probes,
        }
    }

    fn wal_probe(&self) -> (bool, String) {
        if !self.wal.recovered_ok() {
            return (false, "recovery has not completed".to_string());
        }
        if let Err(err) = self.wal_root_writable() {
            return (false, format!("root not writable: {err}"));
        }
        match self.wal.durability_degraded_for() {
            Some(age) if age > DURABILITY_GRACE => (
                false,
                format!("durable writes failing for {}s", age.as_secs()),
            ),
            _ => (true, "ok".to_string()),
        }
    }

    /// Gate for the ingest path. Only WAL-level faults reject writes; a sink
    /// outage must never fail a client request (the WAL absorbs it).
    pub fn ingest_gate(&self) -> Result<(), GatewayError> {
        if !self.wal.recovered_ok() {
            return Err(GatewayError::NotReady("wal recovery incomplete".to_string()));
        }
        if let Some(age) = self.wal.durability_degraded_for() {
            if age > DURABILITY_GRACE {
                return Err(GatewayError::NotReady(format!(
                    "durable writes failing for {}s",
                    age.as_secs()
                )));
            }
        }
        Ok(())
    }
}
