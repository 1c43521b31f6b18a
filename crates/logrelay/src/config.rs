//! Gateway configuration.
//!
//! Settings are layered: hard-coded defaults, then an optional YAML file,
//! then `LOGRELAY_*` environment variables (highest priority). The loaded
//! settings live behind [`SharedSettings`]; a SIGHUP swaps in a freshly
//! loaded snapshot atomically while in-flight requests keep the snapshot
//! they started with.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// One registered API key.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    /// Refill rate per token, tokens per second.
    pub rate_limit_rps: u32,
    /// Bucket capacity per token.
    pub rate_limit_burst: u32,
    /// Bearer token for the admin endpoints. Empty disables them.
    pub admin_token: String,
    /// Bearer token string -> key metadata.
    pub api_keys: HashMap<String, ApiKeyEntry>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            rate_limit_rps: 2000,
            rate_limit_burst: 10_000,
            admin_token: String::new(),
            api_keys: HashMap::new(),
        }
    }
}

/// A partial masking rule: exactly one of the variants is meaningful.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PartialRule {
    pub keep_prefix: Option<usize>,
    pub mask_email: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaskingSettings {
    /// Keys masked for every tenant, matched case-insensitively.
    pub baseline_keys: Vec<String>,
    /// Key -> partial rule; keys without a rule are fully masked.
    pub partial_rules: HashMap<String, PartialRule>,
    /// Token string -> additional keys masked for that tenant.
    pub per_token_overrides: HashMap<String, Vec<String>>,
}

impl Default for MaskingSettings {
    fn default() -> Self {
        let mut partial_rules = HashMap::new();
        partial_rules.insert(
            "authorization".to_string(),
            PartialRule {
                keep_prefix: Some(5),
                mask_email: None,
            },
        );
        Self {
            baseline_keys: [
                "password",
                "token",
                "authorization",
                "api_key",
                "secret",
                "card_number",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            partial_rules,
            per_token_overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalSettings {
    pub root_path: PathBuf,
    pub segment_max_bytes: u64,
    pub token_wal_quota_bytes: u64,
    pub token_wal_quota_age_hours: u64,
    pub disk_free_min_ratio: f64,
    pub rotation_time_active_minutes: u64,
    pub rotation_time_idle_hours: u64,
    pub idle_threshold_minutes: u64,
    pub min_rotation_bytes: u64,
    pub force_rotation_hours: u64,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("./wal"),
            segment_max_bytes: 128 * 1024 * 1024,
            token_wal_quota_bytes: 2 * 1024 * 1024 * 1024,
            token_wal_quota_age_hours: 24,
            disk_free_min_ratio: 0.20,
            rotation_time_active_minutes: 5,
            rotation_time_idle_hours: 1,
            idle_threshold_minutes: 10,
            min_rotation_bytes: 64 * 1024,
            force_rotation_hours: 6,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LokiSettings {
    pub base_url: String,
    pub push_path: String,
    /// Optional bearer token sent on pushes and readiness probes.
    pub bearer_token: Option<String>,
    pub timeout_seconds: u64,
    pub max_retries: u32,
    pub backoff_seconds: Vec<u64>,
    pub park_seconds: u64,
    pub max_values_per_push: usize,
    pub max_bytes_per_push: usize,
    /// Scheduler wake-up cadence when no seal events arrive.
    pub tick_seconds: u64,
}

impl Default for LokiSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3100".to_string(),
            push_path: "/loki/api/v1/push".to_string(),
            bearer_token: None,
            timeout_seconds: 30,
            max_retries: 3,
            backoff_seconds: vec![5, 10, 20],
            park_seconds: 60,
            max_values_per_push: 5000,
            max_bytes_per_push: 4 * 1024 * 1024,
            tick_seconds: 1,
        }
    }
}

impl LokiSettings {
    pub fn push_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.push_path
        )
    }

    pub fn ready_url(&self) -> String {
        format!("{}/ready", self.base_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub security: SecuritySettings,
    pub masking: MaskingSettings,
    pub wal: WalSettings,
    pub loki: LokiSettings,
}

impl Settings {
    /// Load settings from an optional YAML file, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut settings = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            Some(path) => {
                warn!("config file {} not found, using defaults", path.display());
                Settings::default()
            }
            None => Settings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Environment variables override file values for the scalar knobs that
    /// differ between deployments.
    fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("LOGRELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("LOGRELAY_PORT") {
            self.server.port = port;
        }
        if let Ok(level) = std::env::var("LOGRELAY_LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Some(rps) = env_parse::<u32>("LOGRELAY_SECURITY_RATE_LIMIT_RPS") {
            self.security.rate_limit_rps = rps;
        }
        if let Some(burst) = env_parse::<u32>("LOGRELAY_SECURITY_RATE_LIMIT_BURST") {
            self.security.rate_limit_burst = burst;
        }
        if let Ok(token) = std::env::var("LOGRELAY_SECURITY_ADMIN_TOKEN") {
            self.security.admin_token = token;
        }
        if let Ok(root) = std::env::var("LOGRELAY_WAL_ROOT_PATH") {
            self.wal.root_path = PathBuf::from(root);
        }
        if let Ok(url) = std::env::var("LOGRELAY_LOKI_BASE_URL") {
            self.loki.base_url = url;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_true() -> bool {
    true
}

/// Hot-reloadable settings handle.
///
/// `snapshot()` hands out the current immutable snapshot; `reload()` swaps
/// in a new one. Readers never block reloads for longer than the pointer
/// swap.
pub struct SharedSettings {
    current: RwLock<Arc<Settings>>,
    path: Option<PathBuf>,
}

impl SharedSettings {
    pub fn new(settings: Settings, path: Option<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            current: RwLock::new(Arc::new(settings)),
            path,
        })
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the config file and swap the snapshot. A failed reload keeps
    /// the previous snapshot in place.
    pub fn reload(&self) {
        match Settings::load(self.path.as_deref()) {
            Ok(settings) => {
                let mut guard = self
                    .current
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                *guard = Arc::new(settings);
                info!("configuration reloaded");
            }
            Err(err) => warn!("configuration reload failed, keeping old snapshot: {err}"),
        }
    }
}
