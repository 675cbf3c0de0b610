//! Tunnel status notifications and snapshots

use chrono::{DateTime, Utc};
use llm_relay_guard::CircuitState;
use serde::Serialize;

use crate::state::TunnelState;

/// Externally visible status change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Connected,
    Reconnecting,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelEvent {
    pub tunnel_id: String,
    pub user_id: String,
    pub status: TunnelStatus,
    pub at: DateTime<Utc>,
}

impl TunnelEvent {
    pub fn new(tunnel_id: &str, user_id: &str, status: TunnelStatus) -> Self {
        Self {
            tunnel_id: tunnel_id.to_string(),
            user_id: user_id.to_string(),
            status,
            at: Utc::now(),
        }
    }
}

/// Point-in-time description of one tunnel
#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub tunnel_id: String,
    pub user_id: String,
    pub state: TunnelState,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub reconnect_attempts: u32,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub pending: usize,
    pub breaker: CircuitState,
}

impl TunnelInfo {
    /// Queue fill ratio in `[0, 1]`
    pub fn saturation(&self) -> f64 {
        if self.queue_capacity == 0 {
            1.0
        } else {
            self.queue_depth as f64 / self.queue_capacity as f64
        }
    }
}
