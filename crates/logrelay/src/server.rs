//! HTTP surface and component wiring.
//!
//! The router follows the usual split: the ingest route carries a request
//! body limit, health and metrics are bare GETs, and the admin routes sit
//! behind the dedicated admin bearer token. [`Gateway`] wires every
//! component from one [`Settings`] value so the binary and the integration
//! tests build the exact same stack.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, info};

use crate::auth::{RateLimiter, TokenRegistry};
use crate::config::{Settings, SharedSettings};
use crate::error::GatewayError;
use crate::forwarder::Forwarder;
use crate::health::Health;
use crate::masking::MaskingEngine;
use crate::metrics::Metrics;
use crate::model::MAX_BATCH_BYTES;
use crate::pipeline::AdmissionPipeline;
use crate::task;
use crate::wal::WalManager;

const INGEST_PATH: &str = "/v1/logs:ingest";
const HEALTHZ_PATH: &str = "/healthz";
const READYZ_PATH: &str = "/readyz";
const METRICS_PATH: &str = "/metrics";
const ADMIN_FLUSH_PATH: &str = "/v1/admin/flush";
const ADMIN_STATUS_PATH: &str = "/v1/admin/status";

/// Headroom over the batch cap so our own TOO_LARGE body wins over the
/// transport-level 413 for borderline requests.
const INGEST_BODY_LIMIT: usize = MAX_BATCH_BYTES + 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SharedSettings>,
    pub pipeline: Arc<AdmissionPipeline>,
    pub registry: Arc<TokenRegistry>,
    pub wal: Arc<WalManager>,
    pub forwarder: Arc<Forwarder>,
    pub health: Arc<Health>,
    pub metrics: Arc<Metrics>,
}

/// Everything the gateway runs: shared state plus the shutdown token.
pub struct Gateway {
    pub state: AppState,
    pub cancel: CancellationToken,
}

impl Gateway {
    /// Wire all components from settings and recover the WAL.
    pub fn build(settings: Settings, config_path: Option<std::path::PathBuf>) -> Result<Self, GatewayError> {
        let shared = SharedSettings::new(settings, config_path);
        let metrics = Metrics::new()
            .map_err(|e| GatewayError::Internal(format!("metrics init failed: {e}")))?;
        let wal = WalManager::new(shared.clone(), metrics.clone());
        wal.recover()?;

        let cancel = CancellationToken::new();
        let forwarder = Forwarder::new(shared.clone(), wal.clone(), metrics.clone(), cancel.clone());
        let health = Health::new(shared.clone(), wal.clone(), forwarder.clone());
        let registry = Arc::new(TokenRegistry::new(shared.clone()));
        let pipeline = Arc::new(AdmissionPipeline::new(
            registry.clone(),
            RateLimiter::new(shared.clone()),
            MaskingEngine::new(shared.clone()),
            wal.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            state: AppState {
                settings: shared,
                pipeline,
                registry,
                wal,
                forwarder,
                health,
                metrics,
            },
            cancel,
        })
    }

    /// Start the forwarder and the sink prober, both panic-supervised.
    pub fn spawn_background(&self) {
        let forwarder = self.state.forwarder.clone();
        let _ = task::spawn_supervised("forwarder", move || forwarder.clone().run());

        let health = self.state.health.clone();
        let cancel = self.cancel.clone();
        let _ = task::spawn_supervised("sink-prober", move || {
            health.clone().run_prober(cancel.clone())
        });
    }

    /// Serve HTTP until the cancellation token fires.
    pub async fn serve(self, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        let cancel = self.cancel.clone();
        let wal = self.state.wal.clone();
        let router = build_router(self.state);
        info!(addr = %listener.local_addr()?, "gateway listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;
        // In-flight requests have drained; leave only sealed segments behind.
        wal.seal(None, false).await;
        Ok(())
    }
}

pub fn build_router(state: AppState) -> Router {
    let ingest_router = Router::new()
        .route(INGEST_PATH, post(ingest))
        .layer(RequestBodyLimitLayer::new(INGEST_BODY_LIMIT))
        .with_state(state.clone());

    let ops_router = Router::new()
        .route(HEALTHZ_PATH, get(healthz))
        .route(READYZ_PATH, get(readyz))
        .route(METRICS_PATH, get(metrics_text))
        .with_state(state.clone());

    let admin_router = Router::new()
        .route(ADMIN_FLUSH_PATH, post(admin_flush))
        .route(ADMIN_STATUS_PATH, get(admin_status))
        .with_state(state.clone());

    Router::new()
        .merge(ingest_router)
        .merge(ops_router)
        .merge(admin_router)
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state, track_request))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "Not Found").into_response()
}

async fn track_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    state
        .metrics
        .http_request_duration_seconds
        .with_label_values(&[&method, &path])
        .observe(started.elapsed().as_secs_f64());
    response
}

fn header_str<'a>(request: &'a Request, name: &str) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

/// `POST /v1/logs:ingest`. Headers are admitted before the body is read so
/// rate-limited callers cost no body I/O.
async fn ingest(State(state): State<AppState>, request: Request) -> Response {
    if let Err(err) = state.health.ingest_gate() {
        return err.into_response();
    }

    let request_id = Uuid::new_v4();
    let authorization = header_str(&request, header::AUTHORIZATION.as_str()).map(str::to_owned);
    let idempotency_key = header_str(&request, "x-idempotency-key").map(str::to_owned);

    let identity = match state.pipeline.admit(authorization.as_deref()) {
        Ok(identity) => identity,
        Err(err) => return err.into_response(),
    };

    let body: Bytes = match axum::body::to_bytes(request.into_body(), INGEST_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return GatewayError::TooLarge(format!("request body unreadable: {err}"))
                .into_response()
        }
    };

    match state
        .pipeline
        .ingest(&identity, idempotency_key.as_deref(), &body)
        .await
    {
        Ok(ack) => {
            debug!(
                tenant = %identity.name,
                %request_id,
                accepted = ack.accepted,
                segment_seq = ack.segment_seq,
                "batch acknowledged"
            );
            (StatusCode::ACCEPTED, Json(ack)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn healthz() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn readyz(State(state): State<AppState>) -> Response {
    let report = state.health.readiness();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => GatewayError::Internal(err.to_string()).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct FlushRequest {
    token: Option<String>,
    #[serde(default)]
    force: bool,
}

/// `POST /v1/admin/flush`: seal matching active segments and wake the
/// forwarder so they ship immediately.
async fn admin_flush(State(state): State<AppState>, request: Request) -> Response {
    if let Err(err) = state
        .registry
        .authenticate_admin(header_str(&request, header::AUTHORIZATION.as_str()))
    {
        return err.into_response();
    }

    let body = match axum::body::to_bytes(request.into_body(), 64 * 1024).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return GatewayError::SchemaInvalid(format!("request body unreadable: {err}"))
                .into_response()
        }
    };
    let flush: FlushRequest = if body.is_empty() {
        FlushRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(flush) => flush,
            Err(err) => return GatewayError::SchemaInvalid(err.to_string()).into_response(),
        }
    };

    let flushed = state.wal.seal(flush.token.as_deref(), flush.force).await;
    Json(json!({ "flushed": flushed })).into_response()
}

/// `GET /v1/admin/status`: per-tenant WAL numbers plus forwarder state.
async fn admin_status(State(state): State<AppState>, request: Request) -> Response {
    if let Err(err) = state
        .registry
        .authenticate_admin(header_str(&request, header::AUTHORIZATION.as_str()))
    {
        return err.into_response();
    }

    let phases = state.forwarder.phases();
    let tenants: Vec<serde_json::Value> = state
        .wal
        .overview()
        .into_iter()
        .map(|overview| {
            let phase = phases
                .get(&overview.dir)
                .cloned()
                .unwrap_or_else(|| "idle".to_string());
            let mut value = serde_json::to_value(&overview).unwrap_or_else(|_| json!({}));
            if let Some(map) = value.as_object_mut() {
                map.insert("forwarder_state".to_string(), json!(phase));
            }
            value
        })
        .collect();

    Json(json!({
        "tenants": tenants,
        "forwarder": {
            "last_pass_age_secs": state.forwarder.progress_age().as_secs(),
        },
    }))
    .into_response()
}
