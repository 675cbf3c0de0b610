//! Channel-backed transport
//!
//! A `ChannelTransport` is one end of a pair of bounded mpsc queues. Real
//! sockets are adapted by spawning a reader and a writer task that pump frames
//! between the socket and the channel ends (see [`ChannelTransport::from_parts`]);
//! tests use [`ChannelTransport::pair`] directly.

use async_trait::async_trait;
use llm_relay_proto::Envelope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{TransportError, TransportResult, TunnelTransport};

/// Default channel depth for each direction
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct ChannelTransport {
    connection_id: String,
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    closed: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ChannelTransport {
    /// Wrap existing channel ends
    ///
    /// `tx` carries envelopes towards the peer, `rx` yields envelopes from it.
    /// The returned flag is shared so I/O pump tasks can mark the transport
    /// closed when the underlying socket goes away.
    pub fn from_parts(
        connection_id: impl Into<String>,
        tx: mpsc::Sender<Envelope>,
        rx: mpsc::Receiver<Envelope>,
    ) -> (Self, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                connection_id: connection_id.into(),
                tx,
                rx: Mutex::new(rx),
                closed: closed.clone(),
                shutdown: CancellationToken::new(),
            },
            closed,
        )
    }

    /// Create two connected in-memory transports
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let id = uuid::Uuid::new_v4();
        let (a, _) = Self::from_parts(format!("mem-{}-a", id), a_tx, a_rx);
        let (b, _) = Self::from_parts(format!("mem-{}-b", id), b_tx, b_rx);
        (a, b)
    }
}

#[async_trait]
impl TunnelTransport for ChannelTransport {
    async fn send(&self, envelope: Envelope) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx.send(envelope).await.map_err(|_| {
            self.closed.store(true, Ordering::SeqCst);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> TransportResult<Option<Envelope>> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            received = rx.recv() => match received {
                Some(envelope) => Ok(Some(envelope)),
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    Ok(None)
                }
            },
            _ = self.shutdown.cancelled() => Ok(None),
        }
    }

    async fn close(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("[{}] Closing transport: {}", self.connection_id, reason);
        }
        self.shutdown.cancel();
        // Closing our receiver half makes the peer's sends fail fast
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
