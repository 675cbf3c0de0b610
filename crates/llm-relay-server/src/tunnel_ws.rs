//! Tunnel endpoint: `GET /v1/tunnel`
//!
//! Credentials and the resume target are checked before the upgrade so a
//! refusal reaches the agent as a plain HTTP problem. After the upgrade the
//! socket is pumped through a [`ChannelTransport`] and handed to the registry.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use llm_relay_auth::SCOPE_TUNNEL;
use llm_relay_control::{ProxyError, TunnelState};
use llm_relay_proto::{Envelope, EnvelopeCodec, HANDSHAKE_ID, RESUME_HEADER};
use llm_relay_transport::{ChannelTransport, TunnelTransport, DEFAULT_CHANNEL_CAPACITY};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::problem::ApiError;
use crate::routes::{bearer_token, AppState};

pub async fn handle_tunnel(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| ProxyError::AuthenticationFailed("missing bearer token".to_string()))?
        .to_string();
    let resume = headers
        .get(RESUME_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let registry = state.relay.registry();
    let identity = registry.authenticate(&token).await?;

    match &resume {
        Some(tunnel_id) => {
            let conn = registry.get(tunnel_id).await.ok_or_else(|| {
                ProxyError::TunnelUnavailable(format!("unknown tunnel {}", tunnel_id))
            })?;
            if conn.user_id() != identity.user_id {
                return Err(ProxyError::AuthenticationFailed(
                    "tunnel belongs to another user".to_string(),
                )
                .into());
            }
            if !matches!(
                conn.state(),
                TunnelState::Reconnecting | TunnelState::Connected
            ) {
                return Err(ProxyError::TunnelUnavailable(format!(
                    "tunnel {} is {}",
                    tunnel_id,
                    conn.state()
                ))
                .into());
            }
        }
        None => {
            if !identity.has_scope(SCOPE_TUNNEL) {
                return Err(ProxyError::AuthenticationFailed(format!(
                    "missing scope '{}'",
                    SCOPE_TUNNEL
                ))
                .into());
            }
        }
    }

    debug!(
        "Upgrading tunnel socket for user {} (resume: {:?})",
        identity.user_id, resume
    );
    Ok(ws
        .max_message_size(EnvelopeCodec::MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| attach_tunnel(state, socket, token, resume))
        .into_response())
}

async fn attach_tunnel(state: AppState, socket: WebSocket, token: String, resume: Option<String>) {
    let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
    let transport: Arc<dyn TunnelTransport> = Arc::new(pump(socket, connection_id.clone()));
    let registry = state.relay.registry();

    let result = match resume.as_deref() {
        Some(tunnel_id) => registry.resume(tunnel_id, &token, transport.clone()).await,
        None => registry.establish(&token, transport.clone()).await,
    };

    match result {
        Ok(conn) => info!("[{}] Serving tunnel {}", connection_id, conn.id()),
        Err(e) => {
            // Lost a race with a close or a concurrent resume
            warn!("[{}] Tunnel refused after upgrade: {}", connection_id, e);
            if let Ok(refusal) = Envelope::error(HANDSHAKE_ID, e.code(), e.to_string()) {
                let _ = transport.send(refusal).await;
            }
            transport.close("tunnel refused").await;
        }
    }
}

/// Reader and writer tasks between the socket and a channel transport
fn pump(socket: WebSocket, connection_id: String) -> ChannelTransport {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope>(DEFAULT_CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Envelope>(DEFAULT_CHANNEL_CAPACITY);
    let (transport, closed) = ChannelTransport::from_parts(connection_id.clone(), out_tx, in_rx);

    let writer_closed = closed.clone();
    let writer_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let frame = match EnvelopeCodec::encode(&envelope) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[{}] Dropping unencodable envelope {}: {}", writer_id, envelope.id, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Binary(frame)).await {
                debug!("[{}] WebSocket send error: {}", writer_id, e);
                break;
            }
        }
        writer_closed.store(true, Ordering::SeqCst);
        let _ = sink.close().await;
        debug!("[{}] WebSocket writer task ended", writer_id);
    });

    tokio::spawn(async move {
        while let Some(message) = source.next().await {
            match message {
                Ok(Message::Binary(data)) => match EnvelopeCodec::decode_frame(&data) {
                    Ok(envelope) => {
                        if in_tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("[{}] Dropping undecodable frame: {}", connection_id, e),
                },
                Ok(Message::Close(frame)) => {
                    debug!("[{}] Agent closed the socket: {:?}", connection_id, frame);
                    break;
                }
                Ok(Message::Text(_)) => {
                    warn!("[{}] Ignoring text frame on tunnel socket", connection_id)
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("[{}] WebSocket read error: {}", connection_id, e);
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
        debug!("[{}] WebSocket reader task ended", connection_id);
    });

    transport
}
