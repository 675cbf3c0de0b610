//! Per-tunnel lifecycle driver
//!
//! One task per tunnel owns the link: it sends heartbeats, detects silence,
//! dispatches queued requests through the breaker, routes inbound envelopes
//! to the correlator and, when the link drops, waits for the agent to re-dial
//! with exponential backoff. A second task sweeps expired requests.

use llm_relay_guard::BreakerError;
use llm_relay_proto::{
    now_millis, Envelope, EnvelopeKind, ErrorCode, ErrorPayload, Heartbeat, ProxyResponse,
};
use llm_relay_transport::TunnelTransport;
use std::sync::{Arc, Weak};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::connection::{ResumeReceiver, TunnelConnection};
use crate::error::ProxyError;
use crate::reconnect::ReconnectManager;
use crate::registry::RegistryInner;

enum LinkEnd {
    /// The tunnel is being closed
    Cancelled,
    /// The agent re-dialed while the old link still looked alive
    Replaced(Arc<dyn TunnelTransport>),
    /// Transport error, peer close or missed heartbeats
    Lost(String),
}

enum Resume {
    Resumed(Arc<dyn TunnelTransport>),
    Cancelled,
    Exhausted,
}

pub(crate) fn spawn(
    registry: &Arc<RegistryInner>,
    conn: Arc<TunnelConnection>,
    transport: Arc<dyn TunnelTransport>,
    resume_rx: ResumeReceiver,
) {
    let driver = tokio::spawn(run(
        Arc::downgrade(registry),
        conn.clone(),
        transport,
        resume_rx,
    ));
    let sweeper = tokio::spawn(sweep_loop(conn.clone()));
    registry.tasks().register(conn.id(), driver);
    registry.tasks().register(conn.id(), sweeper);
}

async fn run(
    registry: Weak<RegistryInner>,
    conn: Arc<TunnelConnection>,
    mut link: Arc<dyn TunnelTransport>,
    mut resume_rx: ResumeReceiver,
) {
    loop {
        let connected = registry
            .upgrade()
            .map(|r| r.mark_connected(&conn))
            .unwrap_or(false);
        if !connected {
            link.close("tunnel closing").await;
            return;
        }

        conn.set_link(Some(link.clone()));
        let end = serve_link(&conn, &link, &mut resume_rx).await;
        conn.set_link(None);

        match end {
            LinkEnd::Cancelled => {
                link.close("tunnel closed").await;
                return;
            }
            LinkEnd::Replaced(next) => {
                info!(
                    "Tunnel {} switched to resumed link {}",
                    conn.id(),
                    next.connection_id()
                );
                link.close("superseded by resumed link").await;
                link = next;
            }
            LinkEnd::Lost(reason) => {
                warn!("Tunnel {} link lost: {}", conn.id(), reason);
                link.close(&reason).await;

                let reconnecting = registry
                    .upgrade()
                    .map(|r| r.mark_reconnecting(&conn))
                    .unwrap_or(false);
                if !reconnecting {
                    return;
                }

                match await_resume(&conn, &mut resume_rx).await {
                    Resume::Resumed(next) => link = next,
                    Resume::Cancelled => return,
                    Resume::Exhausted => {
                        if let Some(registry) = registry.upgrade() {
                            registry.mark_failed(&conn).await;
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn serve_link(
    conn: &TunnelConnection,
    link: &Arc<dyn TunnelTransport>,
    resume_rx: &mut ResumeReceiver,
) -> LinkEnd {
    let heartbeat = conn.settings().heartbeat.clone();
    let dead_after = heartbeat.dead_after();
    let mut ticker =
        tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut ping_seq: u64 = 0;

    // Requests queued while the link was down
    if let Err(reason) = dispatch(conn, link).await {
        return LinkEnd::Lost(reason);
    }

    loop {
        tokio::select! {
            biased;

            _ = conn.cancel_token().cancelled() => return LinkEnd::Cancelled,

            Some(next) = resume_rx.recv() => return LinkEnd::Replaced(next),

            inbound = link.recv() => match inbound {
                Ok(Some(envelope)) => {
                    last_seen = Instant::now();
                    conn.touch_heartbeat();
                    if let Err(reason) = handle_inbound(conn, link, envelope).await {
                        return LinkEnd::Lost(reason);
                    }
                }
                Ok(None) => return LinkEnd::Lost("agent closed the connection".to_string()),
                Err(e) => return LinkEnd::Lost(e.to_string()),
            },

            _ = conn.queue().notified() => {
                if let Err(reason) = dispatch(conn, link).await {
                    return LinkEnd::Lost(reason);
                }
            }

            _ = ticker.tick() => {
                let silent_for = last_seen.elapsed();
                if silent_for >= dead_after {
                    return LinkEnd::Lost(format!(
                        "no heartbeat for {}s",
                        silent_for.as_secs()
                    ));
                }

                ping_seq += 1;
                let ping = match Envelope::ping(format!("ping-{}", ping_seq), now_millis()) {
                    Ok(ping) => ping,
                    Err(e) => return LinkEnd::Lost(e.to_string()),
                };
                debug!("Sending ping to tunnel {}", conn.id());
                if let Err(e) = link.send(ping).await {
                    return LinkEnd::Lost(e.to_string());
                }

                if let Err(reason) = dispatch(conn, link).await {
                    return LinkEnd::Lost(reason);
                }
            }
        }
    }
}

/// Transmit everything queued, highest priority first
///
/// A transport failure puts the request back at the head of its lane and
/// reports the link as lost.
async fn dispatch(conn: &TunnelConnection, link: &Arc<dyn TunnelTransport>) -> Result<(), String> {
    while let Some(item) = conn.queue().pop() {
        conn.metrics().set_queue_depth(conn.id(), conn.queue().len());

        // Expired or abandoned while queued
        if !conn.pending().contains(&item.correlation_id) {
            debug!("Skipping abandoned request {}", item.correlation_id);
            continue;
        }

        let envelope = match Envelope::request(item.correlation_id.clone(), &item.request) {
            Ok(envelope) => envelope,
            Err(e) => {
                conn.pending()
                    .fail(&item.correlation_id, ProxyError::ProtocolError(e.to_string()));
                continue;
            }
        };

        match conn.breaker().execute(|| link.send(envelope)).await {
            Ok(()) => {
                debug!(
                    "Sent request {} on tunnel {} after {}ms in queue",
                    item.correlation_id,
                    conn.id(),
                    item.enqueued_at.elapsed().as_millis()
                );
            }
            Err(BreakerError::Open { retry_after }) => {
                conn.pending()
                    .fail(&item.correlation_id, ProxyError::CircuitOpen { retry_after });
            }
            Err(BreakerError::Timeout(after)) => {
                conn.pending().fail(
                    &item.correlation_id,
                    ProxyError::TunnelUnavailable(format!(
                        "send timed out after {}ms",
                        after.as_millis()
                    )),
                );
            }
            Err(BreakerError::Inner(e)) => {
                let correlation_id = item.correlation_id.clone();
                match conn.queue().restore_front(item) {
                    Ok(depth) => conn.metrics().set_queue_depth(conn.id(), depth),
                    Err(_) => {
                        conn.pending().fail(
                            &correlation_id,
                            ProxyError::TunnelUnavailable("link dropped during send".to_string()),
                        );
                    }
                }
                return Err(e.to_string());
            }
        }
    }
    Ok(())
}

async fn handle_inbound(
    conn: &TunnelConnection,
    link: &Arc<dyn TunnelTransport>,
    envelope: Envelope,
) -> Result<(), String> {
    match envelope.kind {
        EnvelopeKind::Response => {
            match envelope.decode_payload::<ProxyResponse>(EnvelopeKind::Response) {
                Ok(response) => {
                    conn.pending().resolve(&envelope.id, response);
                }
                Err(e) => {
                    warn!(
                        "Undecodable response {} on tunnel {}: {}",
                        envelope.id,
                        conn.id(),
                        e
                    );
                    conn.metrics().record_error(ErrorCode::ProtocolError);
                    conn.pending()
                        .fail(&envelope.id, ProxyError::ProtocolError(e.to_string()));
                }
            }
        }
        EnvelopeKind::Error => {
            let error = match envelope.decode_payload::<ErrorPayload>(EnvelopeKind::Error) {
                Ok(payload) => ProxyError::from_agent(payload),
                Err(e) => {
                    conn.metrics().record_error(ErrorCode::ProtocolError);
                    ProxyError::ProtocolError(e.to_string())
                }
            };
            conn.pending().fail(&envelope.id, error);
        }
        EnvelopeKind::Pong => {
            debug!("Received pong from tunnel {}", conn.id());
        }
        EnvelopeKind::Ping => {
            let timestamp = envelope
                .decode_payload::<Heartbeat>(EnvelopeKind::Ping)
                .map(|hb| hb.timestamp_ms)
                .unwrap_or_else(|_| now_millis());
            let pong = Envelope::pong(envelope.id, timestamp).map_err(|e| e.to_string())?;
            link.send(pong).await.map_err(|e| e.to_string())?;
        }
        EnvelopeKind::Request => {
            warn!(
                "Agent on tunnel {} sent a request ({}), rejecting",
                conn.id(),
                envelope.id
            );
            conn.metrics().record_error(ErrorCode::ProtocolError);
            let reply = Envelope::error(
                envelope.id,
                ErrorCode::ProtocolError,
                "agents may not send requests",
            )
            .map_err(|e| e.to_string())?;
            link.send(reply).await.map_err(|e| e.to_string())?;
        }
    }
    Ok(())
}

async fn await_resume(conn: &TunnelConnection, resume_rx: &mut ResumeReceiver) -> Resume {
    let mut backoff = ReconnectManager::new(conn.settings().reconnect.clone());

    loop {
        let delay = match backoff.next_delay() {
            Ok(delay) => delay,
            Err(_) => {
                warn!(
                    "Tunnel {} gave up after {} reconnect attempts",
                    conn.id(),
                    backoff.attempt().saturating_sub(1)
                );
                return Resume::Exhausted;
            }
        };
        conn.set_reconnect_attempts(backoff.attempt() as u32);

        let window = delay + conn.settings().attempt_timeout;
        info!(
            "Tunnel {} waiting for agent to reconnect (attempt {}, {}ms)",
            conn.id(),
            backoff.attempt(),
            window.as_millis()
        );

        tokio::select! {
            biased;
            _ = conn.cancel_token().cancelled() => return Resume::Cancelled,
            Some(next) = resume_rx.recv() => return Resume::Resumed(next),
            _ = tokio::time::sleep(window) => {
                debug!(
                    "Reconnect attempt {} for tunnel {} timed out",
                    backoff.attempt(),
                    conn.id()
                );
            }
        }
    }
}

async fn sweep_loop(conn: Arc<TunnelConnection>) {
    let mut ticker = tokio::time::interval(conn.settings().queue.sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = conn.cancel_token().cancelled() => break,
            _ = ticker.tick() => {
                let expired = conn.sweep(Instant::now());
                if expired > 0 {
                    debug!("Expired {} requests on tunnel {}", expired, conn.id());
                }
            }
        }
    }
}
