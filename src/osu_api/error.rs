use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;

/// Failures surfaced by the outbound osu! API layer.
///
/// Limiter backpressure never shows up here: a denied slot is retried until it is
/// granted or the caller cancels.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: StatusCode,
        body: String,
    },
    #[error("transport error calling {endpoint}: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to decode {endpoint} payload: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("batch lookup accepts 1..={max} ids, got {got}")]
    InvalidBatch { got: usize, max: usize },
    #[error("token refresh failed: {0}")]
    TokenRefresh(Arc<GatewayError>),
    #[error("invalid request url {0}")]
    Url(String),
    #[error("request cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            GatewayError::Cancelled => true,
            GatewayError::TokenRefresh(inner) => inner.is_cancelled(),
            _ => false,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            GatewayError::Status { status, .. } => Some(*status),
            GatewayError::TokenRefresh(inner) => inner.status(),
            _ => None,
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
