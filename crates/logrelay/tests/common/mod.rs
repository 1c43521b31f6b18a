//! Shared harness for the end-to-end tests: a mock Loki backend that
//! captures pushes, and a fully wired gateway on an ephemeral port.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use logrelay::config::{ApiKeyEntry, Settings};
use logrelay::server::{AppState, Gateway};
use tokio_util::sync::CancellationToken;

pub const TOKEN_A: &str = "tok-aaaa";
pub const TOKEN_B: &str = "tok-bbbb";
pub const ADMIN_TOKEN: &str = "admin-secret";

/// Mock Loki backend. Accepted push bodies are recorded in arrival order;
/// the response status is switchable mid-test to simulate outages.
#[derive(Clone)]
pub struct MockSink {
    pub pushes: Arc<Mutex<Vec<serde_json::Value>>>,
    pub attempts: Arc<AtomicUsize>,
    status: Arc<AtomicU16>,
    pub base_url: String,
}

impl MockSink {
    pub async fn start() -> Self {
        let pushes = Arc::new(Mutex::new(Vec::new()));
        let attempts = Arc::new(AtomicUsize::new(0));
        let status = Arc::new(AtomicU16::new(204));

        let sink = (pushes.clone(), attempts.clone(), status.clone());
        let app = Router::new()
            .route("/loki/api/v1/push", post(push_handler))
            .route("/ready", get(|| async { StatusCode::OK }))
            .with_state(sink);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock sink");
        let addr = listener.local_addr().expect("mock sink addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock sink serve");
        });

        Self {
            pushes,
            attempts,
            status,
            base_url: format!("http://{addr}"),
        }
    }

    pub fn respond_with(&self, status: u16) {
        self.status.store(status, Ordering::SeqCst);
    }

    /// Every line accepted so far, in arrival order.
    pub fn lines(&self) -> Vec<String> {
        let pushes = self.pushes.lock().unwrap();
        let mut lines = Vec::new();
        for push in pushes.iter() {
            if let Some(streams) = push["streams"].as_array() {
                for stream in streams {
                    if let Some(values) = stream["values"].as_array() {
                        for value in values {
                            if let Some(line) = value[1].as_str() {
                                lines.push(line.to_string());
                            }
                        }
                    }
                }
            }
        }
        lines
    }
}

type SinkState = (
    Arc<Mutex<Vec<serde_json::Value>>>,
    Arc<AtomicUsize>,
    Arc<AtomicU16>,
);

async fn push_handler(State((pushes, attempts, status)): State<SinkState>, body: Bytes) -> StatusCode {
    attempts.fetch_add(1, Ordering::SeqCst);
    let code = StatusCode::from_u16(status.load(Ordering::SeqCst)).unwrap_or(StatusCode::NO_CONTENT);
    if code.is_success() {
        if let Ok(value) = serde_json::from_slice(&body) {
            pushes.lock().unwrap().push(value);
        }
    }
    code
}

/// A running gateway plus everything a test needs to poke at it.
pub struct TestGateway {
    pub base_url: String,
    pub state: AppState,
    pub cancel: CancellationToken,
    _wal_dir: tempfile::TempDir,
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub async fn start_gateway(sink_url: &str, tune: impl FnOnce(&mut Settings)) -> TestGateway {
    let wal_dir = tempfile::tempdir().expect("wal tempdir");

    let mut settings = Settings::default();
    settings.wal.root_path = wal_dir.path().join("wal");
    settings.security.admin_token = ADMIN_TOKEN.to_string();
    settings.security.api_keys.insert(
        TOKEN_A.to_string(),
        ApiKeyEntry {
            name: "team-a".to_string(),
            active: true,
        },
    );
    settings.security.api_keys.insert(
        TOKEN_B.to_string(),
        ApiKeyEntry {
            name: "team-b".to_string(),
            active: true,
        },
    );
    settings.loki.base_url = sink_url.to_string();
    settings.loki.timeout_seconds = 5;
    settings.loki.backoff_seconds = vec![1, 1, 1];
    settings.loki.park_seconds = 1;
    settings.loki.tick_seconds = 1;
    tune(&mut settings);

    let gateway = Gateway::build(settings, None).expect("gateway build");
    gateway.spawn_background();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");
    let state = gateway.state.clone();
    let cancel = gateway.cancel.clone();
    tokio::spawn(async move {
        let _ = gateway.serve(listener).await;
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        state,
        cancel,
        _wal_dir: wal_dir,
    }
}

pub fn entry_json(message: &str) -> serde_json::Value {
    serde_json::json!({
        "timestamp": chrono_now_rfc3339(),
        "level": "INFO",
        "message": message,
        "service": "s",
        "env": "dev"
    })
}

pub fn chrono_now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub async fn post_batch(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    entries: serde_json::Value,
) -> reqwest::Response {
    client
        .post(format!("{base_url}/v1/logs:ingest"))
        .bearer_auth(token)
        .json(&serde_json::json!({ "entries": entries }))
        .send()
        .await
        .expect("ingest request")
}

pub async fn admin_flush(client: &reqwest::Client, base_url: &str) -> reqwest::Response {
    client
        .post(format!("{base_url}/v1/admin/flush"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&serde_json::json!({}))
        .send()
        .await
        .expect("flush request")
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
