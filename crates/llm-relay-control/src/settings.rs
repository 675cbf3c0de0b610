//! Per-tunnel tuning captured at establishment

use llm_relay_guard::CircuitBreakerConfig;
use std::time::Duration;

use crate::reconnect::ReconnectConfig;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Ping period
    pub interval: Duration,
    /// Link is presumed dead after `miss_factor × interval` of silence
    pub miss_factor: u32,
}

impl HeartbeatConfig {
    pub fn dead_after(&self) -> Duration {
        self.interval * self.miss_factor.max(1)
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            miss_factor: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    /// Deadline applied when the caller does not ask for one
    pub default_deadline: Duration,
    /// Period of the expired-request sweep
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            default_deadline: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Settings a tunnel keeps for its whole life; a reload only affects tunnels
/// established afterwards
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    /// How long one reconnect attempt waits for the agent to re-dial
    pub attempt_timeout: Duration,
    pub queue: QueueConfig,
    pub breaker: CircuitBreakerConfig,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            attempt_timeout: Duration::from_secs(10),
            queue: QueueConfig::default(),
            breaker: CircuitBreakerConfig::default(),
        }
    }
}
