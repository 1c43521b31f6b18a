//! Gateway error kinds and their HTTP mapping.
//!
//! Admission errors are local to the request that produced them; each kind
//! carries the machine-readable `code` the client sees in the JSON body.
//! Forwarder-internal outcomes (poison, transient) and WAL corruption never
//! surface here.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Errors surfaced to ingest clients.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unknown or inactive token")]
    Unauthenticated,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("schema validation failed: {0}")]
    SchemaInvalid(String),

    #[error("payload too large: {0}")]
    TooLarge(String),

    #[error("tenant WAL quota nearly exhausted")]
    QuotaSoft,

    #[error("gateway disk pressure")]
    QuotaHard,

    #[error("gateway not ready: {0}")]
    NotReady(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. }
            | GatewayError::QuotaSoft
            | GatewayError::QuotaHard => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::SchemaInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code, stable across releases.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "UNAUTHENTICATED",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::SchemaInvalid(_) => "SCHEMA_INVALID",
            GatewayError::TooLarge(_) => "TOO_LARGE",
            GatewayError::QuotaSoft => "QUOTA_SOFT",
            GatewayError::QuotaHard => "QUOTA_HARD",
            GatewayError::NotReady(_) => "NOT_READY",
            GatewayError::Internal(_) => "INTERNAL",
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("request failed: {self}");
        } else {
            warn!("request rejected: {self}");
        }

        let body = axum::Json(json!({
            "code": self.code(),
            "message": self.to_string(),
        }));

        match self {
            GatewayError::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::SchemaInvalid("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::TooLarge("x".into()).status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(GatewayError::QuotaSoft.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(GatewayError::QuotaHard.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            GatewayError::NotReady("wal".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn quota_variants_share_status_but_not_code() {
        assert_eq!(GatewayError::QuotaSoft.status(), GatewayError::QuotaHard.status());
        assert_ne!(GatewayError::QuotaSoft.code(), GatewayError::QuotaHard.code());
    }
}
