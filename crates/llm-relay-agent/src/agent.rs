use llm_relay_control::{ReconnectConfig, ReconnectError, ReconnectManager};
use llm_relay_proto::{
    Envelope, EnvelopeKind, ErrorCode, ErrorPayload, HandshakeAccepted, Heartbeat, ProxyRequest,
    HANDSHAKE_ID,
};
use llm_relay_transport::TunnelTransport;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::forwarder::UpstreamForwarder;
use crate::websocket;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    #[error("Relay refused the tunnel (HTTP {status})")]
    Rejected { status: u16 },

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Reconnect(#[from] ReconnectError),
}

impl AgentError {
    /// Credentials were refused; retrying cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::InvalidConfig(_) | AgentError::Rejected { status: 401 | 403 }
        )
    }
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Tunnel endpoint, e.g. `wss://relay.example.com/v1/tunnel`
    pub relay_url: String,

    /// Bearer token presented on every handshake
    pub token: String,

    /// Base URL of the local model server
    pub upstream: String,

    /// Upper bound for one upstream call
    pub request_timeout: Duration,

    /// Silence after which the relay is presumed gone
    pub idle_timeout: Duration,

    /// How long to wait for the relay's handshake frame
    pub handshake_timeout: Duration,

    pub reconnect: ReconnectConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://localhost:8080/v1/tunnel".to_string(),
            token: String::new(),
            upstream: "http://127.0.0.1:11434".to_string(),
            request_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(90),
            handshake_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig {
                max_backoff: Duration::from_secs(30),
                max_attempts: None,
                ..ReconnectConfig::default()
            },
        }
    }
}

/// Why a served link stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    Cancelled,
    Lost(String),
}

/// The local agent: one tunnel to the relay, re-dialed until cancelled
pub struct Agent {
    config: AgentConfig,
    forwarder: Arc<UpstreamForwarder>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if !(config.relay_url.starts_with("ws://") || config.relay_url.starts_with("wss://")) {
            return Err(AgentError::InvalidConfig(format!(
                "relay URL '{}' must use ws:// or wss://",
                config.relay_url
            )));
        }
        if config.token.is_empty() {
            return Err(AgentError::InvalidConfig("token is required".to_string()));
        }

        let forwarder = UpstreamForwarder::new(&config.upstream, config.request_timeout)
            .map_err(|e| AgentError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            config,
            forwarder: Arc::new(forwarder),
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Keep a tunnel open until `cancel` fires
    ///
    /// After a drop the agent re-dials with backoff and asks to resume the
    /// same tunnel. If the relay no longer knows it, a fresh tunnel is opened.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AgentError> {
        let mut backoff = ReconnectManager::new(self.config.reconnect.clone());
        let mut tunnel_id: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.connect(tunnel_id.as_deref()).await {
                Ok((link, accepted)) => {
                    if tunnel_id.as_deref() == Some(accepted.tunnel_id.as_str()) {
                        info!("🔄 Tunnel {} resumed", accepted.tunnel_id);
                    } else {
                        info!(
                            "✅ Tunnel {} open for user {}",
                            accepted.tunnel_id, accepted.user_id
                        );
                    }
                    tunnel_id = Some(accepted.tunnel_id);
                    backoff.reset();

                    let outcome = self.serve_link(link.clone(), &cancel).await;
                    link.close("agent leaving").await;
                    match outcome {
                        LinkOutcome::Cancelled => return Ok(()),
                        LinkOutcome::Lost(reason) => warn!("Relay link lost: {}", reason),
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("❌ {}", e);
                    return Err(e);
                }
                Err(AgentError::Rejected { status }) if tunnel_id.is_some() => {
                    warn!(
                        "Relay refused to resume tunnel (HTTP {}), opening a new one",
                        status
                    );
                    tunnel_id = None;
                }
                Err(e) => warn!("Connection attempt failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                waited = backoff.wait() => waited?,
            }
        }
    }

    async fn connect(
        &self,
        resume: Option<&str>,
    ) -> Result<(Arc<dyn TunnelTransport>, HandshakeAccepted), AgentError> {
        let link: Arc<dyn TunnelTransport> =
            Arc::new(websocket::dial(&self.config.relay_url, &self.config.token, resume).await?);

        let first = tokio::time::timeout(self.config.handshake_timeout, link.recv())
            .await
            .map_err(|_| AgentError::Handshake("no handshake frame".to_string()))?
            .map_err(|e| AgentError::Handshake(e.to_string()))?
            .ok_or_else(|| AgentError::Handshake("relay closed during handshake".to_string()))?;

        match first.kind {
            EnvelopeKind::Response if first.id == HANDSHAKE_ID => {
                let accepted = first
                    .decode_payload::<HandshakeAccepted>(EnvelopeKind::Response)
                    .map_err(|e| AgentError::Handshake(e.to_string()))?;
                Ok((link, accepted))
            }
            EnvelopeKind::Error => {
                let reason = first
                    .decode_payload::<ErrorPayload>(EnvelopeKind::Error)
                    .map(|p| format!("{}: {}", p.code, p.message))
                    .unwrap_or_else(|e| e.to_string());
                link.close("handshake refused").await;
                Err(AgentError::Handshake(reason))
            }
            other => {
                link.close("unexpected handshake frame").await;
                Err(AgentError::Handshake(format!(
                    "expected handshake, got {:?}",
                    other
                )))
            }
        }
    }

    /// Serve one established link until it drops or `cancel` fires
    pub async fn serve_link(
        &self,
        link: Arc<dyn TunnelTransport>,
        cancel: &CancellationToken,
    ) -> LinkOutcome {
        loop {
            let inbound = tokio::select! {
                _ = cancel.cancelled() => return LinkOutcome::Cancelled,
                inbound = tokio::time::timeout(self.config.idle_timeout, link.recv()) => inbound,
            };

            let envelope = match inbound {
                Err(_) => {
                    return LinkOutcome::Lost(format!(
                        "relay silent for {}s",
                        self.config.idle_timeout.as_secs()
                    ))
                }
                Ok(Err(e)) => return LinkOutcome::Lost(e.to_string()),
                Ok(Ok(None)) => return LinkOutcome::Lost("relay closed the connection".to_string()),
                Ok(Ok(Some(envelope))) => envelope,
            };

            match envelope.kind {
                EnvelopeKind::Ping => {
                    let timestamp = envelope
                        .decode_payload::<Heartbeat>(EnvelopeKind::Ping)
                        .map(|hb| hb.timestamp_ms)
                        .unwrap_or_default();
                    let pong = match Envelope::pong(envelope.id, timestamp) {
                        Ok(pong) => pong,
                        Err(e) => return LinkOutcome::Lost(e.to_string()),
                    };
                    if let Err(e) = link.send(pong).await {
                        return LinkOutcome::Lost(e.to_string());
                    }
                }
                EnvelopeKind::Request => self.spawn_forward(link.clone(), envelope),
                EnvelopeKind::Pong => debug!("Pong from relay"),
                EnvelopeKind::Error => {
                    let detail = envelope
                        .decode_payload::<ErrorPayload>(EnvelopeKind::Error)
                        .map(|p| format!("{}: {}", p.code, p.message))
                        .unwrap_or_else(|e| e.to_string());
                    warn!("Relay reported error for {}: {}", envelope.id, detail);
                }
                EnvelopeKind::Response => {
                    debug!("Ignoring unexpected response {} from relay", envelope.id);
                }
            }
        }
    }

    /// Requests are served concurrently; each answers on the same link
    fn spawn_forward(&self, link: Arc<dyn TunnelTransport>, envelope: Envelope) {
        let forwarder = self.forwarder.clone();
        tokio::spawn(async move {
            let correlation_id = envelope.id.clone();
            let reply = match envelope.decode_payload::<ProxyRequest>(EnvelopeKind::Request) {
                Ok(request) => {
                    debug!(
                        "Request {}: {} {}",
                        correlation_id, request.method, request.path
                    );
                    match forwarder.forward(&request).await {
                        Ok(response) => Envelope::response(correlation_id.clone(), &response),
                        Err(e) => {
                            warn!("Request {} failed upstream: {}", correlation_id, e);
                            Envelope::error(correlation_id.clone(), e.code(), e.to_string())
                        }
                    }
                }
                Err(e) => Envelope::error(
                    correlation_id.clone(),
                    ErrorCode::ProtocolError,
                    format!("undecodable request: {}", e),
                ),
            };

            match reply {
                Ok(reply) => {
                    if let Err(e) = link.send(reply).await {
                        debug!("Could not answer {}: {}", correlation_id, e);
                    }
                }
                Err(e) => warn!("Could not encode reply for {}: {}", correlation_id, e),
            }
        });
    }
}
