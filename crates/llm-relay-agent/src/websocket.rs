//! WebSocket link to the relay
//!
//! The socket is split into a reader and a writer task that pump encoded
//! envelopes between the WebSocket and a [`ChannelTransport`], one envelope
//! per binary message.

use futures_util::{SinkExt, StreamExt};
use llm_relay_proto::{Envelope, EnvelopeCodec, RESUME_HEADER};
use llm_relay_transport::{ChannelTransport, DEFAULT_CHANNEL_CAPACITY};
use std::sync::atomic::Ordering;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, warn};

use crate::agent::AgentError;

/// Open the tunnel socket, presenting `token` and optionally the tunnel to resume
pub async fn dial(
    relay_url: &str,
    token: &str,
    resume: Option<&str>,
) -> Result<ChannelTransport, AgentError> {
    let mut request = relay_url
        .into_client_request()
        .map_err(|e| AgentError::InvalidConfig(format!("relay URL: {}", e)))?;

    let bearer = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| AgentError::InvalidConfig("token is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);

    if let Some(tunnel_id) = resume {
        let value = HeaderValue::from_str(tunnel_id)
            .map_err(|_| AgentError::Handshake(format!("bad tunnel id '{}'", tunnel_id)))?;
        request.headers_mut().insert(RESUME_HEADER, value);
    }

    let (ws, _response) = connect_async(request).await.map_err(|e| match e {
        WsError::Http(response) => AgentError::Rejected {
            status: response.status().as_u16(),
        },
        other => AgentError::Connect(other.to_string()),
    })?;

    let connection_id = format!("ws-{}", uuid::Uuid::new_v4());
    debug!("[{}] Connected to {}", connection_id, relay_url);
    Ok(attach(ws, connection_id))
}

/// Pump an established WebSocket through a channel transport
pub fn attach<S>(ws: WebSocketStream<S>, connection_id: String) -> ChannelTransport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut source) = ws.split();
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
            if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
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
                    debug!("[{}] Relay closed the socket: {:?}", connection_id, frame);
                    break;
                }
                // Control frames are answered by tungstenite
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
