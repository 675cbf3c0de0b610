//! Transport abstraction layer for tunnel connections
//!
//! The tunnel core only needs an ordered, bidirectional envelope channel. This
//! crate defines that contract ([`TunnelTransport`]) so the lifecycle code does
//! not depend on WebSocket specifics.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │        Tunnel lifecycle (heartbeat, dispatch)            │
//! └─────────────────────────────────────────────────────────┘
//!                           │ Arc<dyn TunnelTransport>
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │   ChannelTransport (mpsc pair, pumped by I/O tasks)      │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!               ┌───────────┴────────────┐
//!               ↓                        ↓
//!        axum WebSocket           in-memory peer
//!        (relay side)             (tests, embedding)
//! ```

pub mod channel;

pub use channel::{ChannelTransport, DEFAULT_CHANNEL_CAPACITY};

use async_trait::async_trait;
use llm_relay_proto::Envelope;
use std::fmt::Debug;
use thiserror::Error;

/// Transport-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bidirectional, ordered envelope channel to one agent
///
/// Both directions take `&self` so the lifecycle task can wait for inbound
/// envelopes while transmitting from another branch of the same `select!`.
#[async_trait]
pub trait TunnelTransport: Send + Sync + Debug {
    /// Send an envelope to the peer
    async fn send(&self, envelope: Envelope) -> TransportResult<()>;

    /// Receive the next envelope from the peer
    ///
    /// Returns `None` once the peer has closed the channel.
    async fn recv(&self) -> TransportResult<Option<Envelope>>;

    /// Close the channel; pending sends are dropped
    async fn close(&self, reason: &str);

    /// Check if the channel is closed
    fn is_closed(&self) -> bool;

    /// Stable identifier for logging
    fn connection_id(&self) -> String;
}
