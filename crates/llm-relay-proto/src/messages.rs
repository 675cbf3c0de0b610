//! Protocol message types

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::error_code::ErrorCode;

/// Envelope kind, mirrors the `type` discriminator of the tunnel protocol
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Request,
    Response,
    Ping,
    Pong,
    Error,
}

/// Typed envelope carried over a tunnel.
///
/// `id` is the correlation id linking a `Request` to its `Response` or `Error`.
/// Heartbeat envelopes use a fresh id that is never correlated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

/// HTTP-shaped request forwarded to the local model server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProxyRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Buffered response returned by the local model server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Liveness probe payload for `Ping` and `Pong`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub timestamp_ms: u64,
}

/// Error reported by either side of a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// First frame sent by the relay once a handshake is accepted
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeAccepted {
    pub tunnel_id: String,
    pub user_id: String,
}

impl Envelope {
    fn with_payload<T: Serialize>(
        id: impl Into<String>,
        kind: EnvelopeKind,
        payload: &T,
    ) -> Result<Self, CodecError> {
        Ok(Self {
            id: id.into(),
            kind,
            payload: bincode::serialize(payload)?,
        })
    }

    pub fn request(id: impl Into<String>, request: &ProxyRequest) -> Result<Self, CodecError> {
        Self::with_payload(id, EnvelopeKind::Request, request)
    }

    pub fn response(id: impl Into<String>, response: &ProxyResponse) -> Result<Self, CodecError> {
        Self::with_payload(id, EnvelopeKind::Response, response)
    }

    pub fn ping(id: impl Into<String>, timestamp_ms: u64) -> Result<Self, CodecError> {
        Self::with_payload(id, EnvelopeKind::Ping, &Heartbeat { timestamp_ms })
    }

    pub fn pong(id: impl Into<String>, timestamp_ms: u64) -> Result<Self, CodecError> {
        Self::with_payload(id, EnvelopeKind::Pong, &Heartbeat { timestamp_ms })
    }

    pub fn error(
        id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Result<Self, CodecError> {
        Self::with_payload(
            id,
            EnvelopeKind::Error,
            &ErrorPayload {
                code,
                message: message.into(),
            },
        )
    }

    pub fn handshake(accepted: &HandshakeAccepted) -> Result<Self, CodecError> {
        Self::with_payload(crate::HANDSHAKE_ID, EnvelopeKind::Response, accepted)
    }

    /// Decode the payload, checking it against the envelope kind
    pub fn decode_payload<T: DeserializeOwned>(
        &self,
        expected: EnvelopeKind,
    ) -> Result<T, CodecError> {
        if self.kind != expected {
            return Err(CodecError::UnexpectedKind {
                expected,
                actual: self.kind,
            });
        }
        Ok(bincode::deserialize(&self.payload)?)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Ping | EnvelopeKind::Pong)
    }
}

/// Milliseconds since the Unix epoch, for heartbeat timestamps
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_payload_roundtrip() {
        let request = ProxyRequest {
            method: "POST".to_string(),
            path: "/api/generate".to_string(),
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: br#"{"model":"llama3"}"#.to_vec(),
        };

        let envelope = Envelope::request("req-1", &request).unwrap();
        assert_eq!(envelope.kind, EnvelopeKind::Request);

        let decoded: ProxyRequest = envelope.decode_payload(EnvelopeKind::Request).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_kind_mismatch_is_rejected() {
        let envelope = Envelope::ping("hb-1", 42).unwrap();
        let result: Result<ProxyResponse, _> = envelope.decode_payload(EnvelopeKind::Response);
        assert!(matches!(
            result,
            Err(CodecError::UnexpectedKind {
                expected: EnvelopeKind::Response,
                actual: EnvelopeKind::Ping
            })
        ));
    }

    #[test]
    fn test_error_envelope_carries_code() {
        let envelope = Envelope::error("req-9", ErrorCode::ProtocolError, "bad frame").unwrap();
        let payload: ErrorPayload = envelope.decode_payload(EnvelopeKind::Error).unwrap();
        assert_eq!(payload.code, ErrorCode::ProtocolError);
        assert_eq!(payload.message, "bad frame");
    }

    #[test]
    fn test_handshake_uses_reserved_id() {
        let envelope = Envelope::handshake(&HandshakeAccepted {
            tunnel_id: "t-1".to_string(),
            user_id: "alice".to_string(),
        })
        .unwrap();
        assert_eq!(envelope.id, crate::HANDSHAKE_ID);
        assert!(!envelope.is_heartbeat());
    }
}
