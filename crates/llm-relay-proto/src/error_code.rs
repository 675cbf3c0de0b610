//! Stable, caller-visible error codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes shared by the wire protocol and the HTTP surface.
///
/// The string form is part of the public contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    TunnelUnavailable,
    QueueFull,
    RequestTimeout,
    CircuitOpen,
    RateLimitExceeded,
    ProtocolError,
    TunnelClosed,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::AuthenticationFailed,
        ErrorCode::TunnelUnavailable,
        ErrorCode::QueueFull,
        ErrorCode::RequestTimeout,
        ErrorCode::CircuitOpen,
        ErrorCode::RateLimitExceeded,
        ErrorCode::ProtocolError,
        ErrorCode::TunnelClosed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCode::TunnelUnavailable => "TUNNEL_UNAVAILABLE",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::TunnelClosed => "TUNNEL_CLOSED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
