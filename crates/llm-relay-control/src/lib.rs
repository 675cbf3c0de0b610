//! Tunnel control plane
//!
//! Owns every agent tunnel: registration and replacement per user, the
//! connection state machine, heartbeats, relay-side reconnection windows,
//! the bounded priority queue and the correlation of responses to waiting
//! callers.
//!
//! ```text
//! establish ──► connecting ──► connected ◄──► reconnecting ──► failed
//!                   │              │               │
//!                   └──────────────┴───► closing ◄─┘
//!                                          │
//!                                          ▼
//!                                        closed
//! ```

pub mod connection;
mod driver;
pub mod error;
pub mod events;
pub mod observers;
pub mod pending_requests;
pub mod queue;
pub mod reconnect;
pub mod registry;
pub mod settings;
pub mod state;
pub mod task_tracker;

pub use connection::TunnelConnection;
pub use error::{ProxyError, QUEUE_FULL_RETRY_HINT};
pub use events::{TunnelEvent, TunnelInfo, TunnelStatus};
pub use observers::{gauge_for, AuditTransitionListener, MetricsTransitionListener};
pub use pending_requests::{PendingRequests, ProxyResult, ResponseHandle};
pub use queue::{Priority, QueuedRequest, RequestQueue};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
pub use registry::TunnelRegistry;
pub use settings::{HeartbeatConfig, QueueConfig, TunnelSettings};
pub use state::{InvalidTransition, TunnelState};
pub use task_tracker::TaskTracker;
