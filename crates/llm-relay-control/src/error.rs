//! Error taxonomy surfaced to proxy callers

use llm_relay_auth::AuthError;
use llm_relay_guard::{LimitControl, RateLimitDenied};
use llm_relay_proto::{ErrorCode, ErrorPayload};
use std::time::Duration;
use thiserror::Error;

/// Suggested back-off when a tunnel queue is saturated
pub const QUEUE_FULL_RETRY_HINT: Duration = Duration::from_secs(1);

/// Every way a proxied request can fail
///
/// Each variant maps to exactly one stable [`ErrorCode`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProxyError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error("Request queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Circuit open, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen { retry_after: Duration },

    #[error(
        "Rate limit exceeded ({}), retry after {}ms",
        .control.as_str(),
        .retry_after.as_millis()
    )]
    RateLimitExceeded {
        control: LimitControl,
        retry_after: Duration,
    },

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Tunnel closed: {0}")]
    TunnelClosed(String),
}

impl ProxyError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProxyError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            ProxyError::TunnelUnavailable(_) => ErrorCode::TunnelUnavailable,
            ProxyError::QueueFull { .. } => ErrorCode::QueueFull,
            ProxyError::RequestTimeout => ErrorCode::RequestTimeout,
            ProxyError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            ProxyError::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            ProxyError::ProtocolError(_) => ErrorCode::ProtocolError,
            ProxyError::TunnelClosed(_) => ErrorCode::TunnelClosed,
        }
    }

    /// Back-off hint for errors that carry one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProxyError::QueueFull { .. } => Some(QUEUE_FULL_RETRY_HINT),
            ProxyError::CircuitOpen { retry_after } => Some(*retry_after),
            ProxyError::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Map an `Error` envelope sent by the agent
    pub fn from_agent(payload: ErrorPayload) -> Self {
        let message = payload.message;
        match payload.code {
            ErrorCode::TunnelUnavailable => ProxyError::TunnelUnavailable(message),
            ErrorCode::RequestTimeout => ProxyError::RequestTimeout,
            ErrorCode::TunnelClosed => ProxyError::TunnelClosed(message),
            ErrorCode::AuthenticationFailed => ProxyError::AuthenticationFailed(message),
            ErrorCode::ProtocolError => ProxyError::ProtocolError(message),
            other => ProxyError::ProtocolError(format!("agent reported {}: {}", other, message)),
        }
    }
}

impl From<AuthError> for ProxyError {
    fn from(e: AuthError) -> Self {
        ProxyError::AuthenticationFailed(e.to_string())
    }
}

impl From<RateLimitDenied> for ProxyError {
    fn from(denied: RateLimitDenied) -> Self {
        ProxyError::RateLimitExceeded {
            control: denied.control,
            retry_after: denied.retry_after,
        }
    }
}
