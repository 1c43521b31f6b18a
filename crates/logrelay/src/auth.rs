//! Bearer-token authentication and per-token rate limiting.
//!
//! Both run off request headers alone so a throttled caller never gets its
//! body read. Buckets are keyed by the raw token string and survive config
//! reloads; the bucket map is LRU-bounded to cap memory under token churn.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::config::SharedSettings;
use crate::error::GatewayError;
use crate::MAX_RATE_BUCKETS;

/// Filesystem- and metrics-safe tenant name: hex of a 64-bit hash of the
/// token. The raw token never appears on disk or in a label.
pub fn token_safe_name(token: &str) -> String {
    format!("{:016x}", token_hash(token))
}

pub fn token_hash(token: &str) -> u64 {
    xxh64(token.as_bytes(), 0)
}

/// An authenticated caller. `name` comes from the registry and is the only
/// identifier used in logs and metric labels.
#[derive(Debug, Clone)]
pub struct TokenIdentity {
    pub token: String,
    pub name: String,
    pub safe_name: String,
    pub token_hash: u64,
}

/// Registry lookup over the current config snapshot.
pub struct TokenRegistry {
    settings: Arc<SharedSettings>,
}

impl TokenRegistry {
    pub fn new(settings: Arc<SharedSettings>) -> Self {
        Self { settings }
    }

    /// Resolve the value of an `Authorization: Bearer <token>` header.
    /// Unknown and inactive tokens are indistinguishable to the caller.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<TokenIdentity, GatewayError> {
        let token = parse_bearer(authorization).ok_or(GatewayError::Unauthenticated)?;
        let snapshot = self.settings.snapshot();
        let entry = snapshot
            .security
            .api_keys
            .get(token)
            .ok_or(GatewayError::Unauthenticated)?;
        if !entry.active {
            debug!(key = %entry.name, "rejecting inactive token");
            return Err(GatewayError::Unauthenticated);
        }
        Ok(TokenIdentity {
            token: token.to_string(),
            name: entry.name.clone(),
            safe_name: token_safe_name(token),
            token_hash: token_hash(token),
        })
    }

    /// Admin endpoints use a single dedicated bearer token.
    pub fn authenticate_admin(&self, authorization: Option<&str>) -> Result<(), GatewayError> {
        let token = parse_bearer(authorization).ok_or(GatewayError::Unauthenticated)?;
        let snapshot = self.settings.snapshot();
        if snapshot.security.admin_token.is_empty() || token != snapshot.security.admin_token {
            return Err(GatewayError::Unauthenticated);
        }
        Ok(())
    }
}

fn parse_bearer(authorization: Option<&str>) -> Option<&str> {
    let value = authorization?.trim();
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Classic token bucket: capacity `burst`, refill `rps` tokens/second.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: u32) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_rate: f64::from(refill_rate),
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn retry_after_secs(&self) -> u64 {
        if self.refill_rate <= 0.0 {
            return 1;
        }
        ((1.0 - self.tokens) / self.refill_rate).ceil().max(1.0) as u64
    }
}

/// Per-token rate limiter with an LRU-bounded bucket map.
pub struct RateLimiter {
    settings: Arc<SharedSettings>,
    buckets: Mutex<LruCache<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new(settings: Arc<SharedSettings>) -> Self {
        let cap = NonZeroUsize::new(MAX_RATE_BUCKETS).unwrap_or(NonZeroUsize::MIN);
        Self {
            settings,
            buckets: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Consume one token for this caller, or fail with `RATE_LIMITED`.
    pub fn check(&self, token: &str) -> Result<(), GatewayError> {
        let snapshot = self.settings.snapshot();
        let mut buckets = self
            .buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let bucket = buckets.get_or_insert_mut(token.to_string(), || {
            TokenBucket::new(
                snapshot.security.rate_limit_burst,
                snapshot.security.rate_limit_rps,
            )
        });
        if bucket.consume(Instant::now()) {
            Ok(())
        } else {
            Err(GatewayError::RateLimited {
                retry_after_secs: bucket.retry_after_secs(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeyEntry, Settings};
    use std::time::Duration;

    fn settings_with_keys(rps: u32, burst: u32) -> Arc<SharedSettings> {
        let mut settings = Settings::default();
        settings.security.rate_limit_rps = rps;
        settings.security.rate_limit_burst = burst;
        settings.security.admin_token = "admin-secret".to_string();
        settings.security.api_keys.insert(
            "tok-live".to_string(),
            ApiKeyEntry {
                name: "team-live".to_string(),
                active: true,
            },
        );
        settings.security.api_keys.insert(
            "tok-dead".to_string(),
            ApiKeyEntry {
                name: "team-dead".to_string(),
                active: false,
            },
        );
        SharedSettings::new(settings, None)
    }

    #[test]
    fn authenticates_known_active_token() {
        let registry = TokenRegistry::new(settings_with_keys(10, 10));
        let identity = registry.authenticate(Some("Bearer tok-live")).unwrap();
        assert_eq!(identity.name, "team-live");
        assert_eq!(identity.safe_name.len(), 16);
        assert_ne!(identity.safe_name, "tok-live");
    }

    #[test]
    fn rejects_unknown_inactive_and_malformed() {
        let registry = TokenRegistry::new(settings_with_keys(10, 10));
        assert!(matches!(
            registry.authenticate(Some("Bearer nope")),
            Err(GatewayError::Unauthenticated)
        ));
        assert!(matches!(
            registry.authenticate(Some("Bearer tok-dead")),
            Err(GatewayError::Unauthenticated)
        ));
        assert!(matches!(
            registry.authenticate(Some("tok-live")),
            Err(GatewayError::Unauthenticated)
        ));
        assert!(matches!(
            registry.authenticate(None),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[test]
    fn admin_token_is_separate() {
        let registry = TokenRegistry::new(settings_with_keys(10, 10));
        registry
            .authenticate_admin(Some("Bearer admin-secret"))
            .unwrap();
        assert!(registry.authenticate_admin(Some("Bearer tok-live")).is_err());
    }

    #[test]
    fn burst_then_limited() {
        let limiter = RateLimiter::new(settings_with_keys(1, 1));
        limiter.check("tok-live").unwrap();
        let err = limiter.check("tok-live").unwrap_err();
        match err {
            GatewayError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn buckets_are_per_token() {
        let limiter = RateLimiter::new(settings_with_keys(1, 1));
        limiter.check("tok-a").unwrap();
        // tok-a exhausted, tok-b still has its own burst.
        assert!(limiter.check("tok-a").is_err());
        limiter.check("tok-b").unwrap();
    }

    #[test]
    fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(1, 10);
        let start = Instant::now();
        assert!(bucket.consume(start));
        assert!(!bucket.consume(start));
        // 200ms at 10 rps refills two tokens, capped at capacity 1.
        assert!(bucket.consume(start + Duration::from_millis(200)));
    }

    #[test]
    fn safe_name_is_stable() {
        assert_eq!(token_safe_name("abc"), token_safe_name("abc"));
        assert_ne!(token_safe_name("abc"), token_safe_name("abd"));
    }
}
