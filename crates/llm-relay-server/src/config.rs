//! Relay configuration
//!
//! Loaded from YAML; every section and field has a default so an empty file
//! is a valid configuration. Durations are spelled out in their unit
//! (`*_secs`, `*_ms`).

use llm_relay_control::{HeartbeatConfig, QueueConfig, ReconnectConfig, TunnelSettings};
use llm_relay_guard::{AdaptiveConfig, CircuitBreakerConfig, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub tunnel: TunnelSection,
    pub queue: QueueSection,
    pub breaker: BreakerSection,
    pub rate_limit: RateLimitSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: SocketAddr,
    /// Let callers without a token through, identified by client IP
    pub allow_anonymous: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            allow_anonymous: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// HS256 secret shared with the token issuer
    pub jwt_secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_factor: u32,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub reconnect_multiplier: f64,
    /// `null` retries forever
    pub reconnect_max_attempts: Option<usize>,
    pub reconnect_jitter: bool,
    pub reconnect_attempt_timeout_secs: u64,
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_miss_factor: 3,
            reconnect_initial_backoff_ms: 1_000,
            reconnect_max_backoff_ms: 60_000,
            reconnect_multiplier: 2.0,
            reconnect_max_attempts: Some(10),
            reconnect_jitter: true,
            reconnect_attempt_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub capacity: usize,
    pub default_deadline_secs: u64,
    /// Upper bound a caller may ask for with `X-Relay-Timeout-Ms`
    pub max_deadline_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: 64,
            default_deadline_secs: 120,
            max_deadline_secs: 600,
            sweep_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub operation_timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub half_open_max_probes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            operation_timeout_ms: 10_000,
            reset_timeout_ms: 30_000,
            half_open_max_probes: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub window_limit: u32,
    pub window_secs: u64,
    pub burst_capacity: u32,
    pub refill_per_sec: f64,
    pub max_concurrent: u32,
    pub exempt: Vec<String>,
    pub adaptive: AdaptiveSection,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            window_limit: 120,
            window_secs: 60,
            burst_capacity: 20,
            refill_per_sec: 2.0,
            max_concurrent: 8,
            exempt: Vec::new(),
            adaptive: AdaptiveSection::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSection {
    pub enabled: bool,
    pub abuse_threshold: u32,
    pub abuse_window_secs: u64,
    pub tighten_factor: f64,
    pub cooldown_secs: u64,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        Self {
            enabled: true,
            abuse_threshold: 20,
            abuse_window_secs: 60,
            tighten_factor: 0.5,
            cooldown_secs: 300,
        }
    }
}

/// Longest deadline any request may be given
pub const MAX_DEADLINE_SECS: u64 = 86_400;

/// Largest accepted reconnect backoff multiplier
pub const MAX_RECONNECT_MULTIPLIER: f64 = 10.0;

/// Slowest accepted burst refill; keeps retry hints under 1000s
pub const MIN_REFILL_PER_SEC: f64 = 0.001;

impl RelayConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes to unit, not to a mapping
        let config: RelayConfig = if content.trim().is_empty() {
            RelayConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.tunnel.heartbeat_interval_secs == 0 {
            return invalid("tunnel.heartbeat_interval_secs must be positive");
        }
        let multiplier = self.tunnel.reconnect_multiplier;
        if !(1.0..=MAX_RECONNECT_MULTIPLIER).contains(&multiplier) {
            return invalid("tunnel.reconnect_multiplier must be in 1.0..=10.0");
        }
        if self.queue.capacity == 0 {
            return invalid("queue.capacity must be positive");
        }
        if self.queue.default_deadline_secs == 0
            || self.queue.default_deadline_secs > self.queue.max_deadline_secs
        {
            return invalid("queue.default_deadline_secs must be in 1..=max_deadline_secs");
        }
        if self.queue.max_deadline_secs > MAX_DEADLINE_SECS {
            return invalid("queue.max_deadline_secs must be at most 86400");
        }
        if self.queue.sweep_interval_ms == 0 {
            return invalid("queue.sweep_interval_ms must be positive");
        }
        if self.breaker.failure_threshold == 0 || self.breaker.success_threshold == 0 {
            return invalid("breaker thresholds must be positive");
        }
        if self.breaker.half_open_max_probes == 0 {
            return invalid("breaker.half_open_max_probes must be positive");
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs must be positive");
        }
        if self.rate_limit.window_limit == 0
            || self.rate_limit.burst_capacity == 0
            || self.rate_limit.max_concurrent == 0
        {
            return invalid("rate_limit limits must be positive");
        }
        let refill = self.rate_limit.refill_per_sec;
        if !(refill.is_finite() && refill >= MIN_REFILL_PER_SEC) {
            return invalid("rate_limit.refill_per_sec must be at least 0.001");
        }
        let factor = self.rate_limit.adaptive.tighten_factor;
        if !(factor > 0.0 && factor <= 1.0) {
            return invalid("rate_limit.adaptive.tighten_factor must be in (0, 1]");
        }
        Ok(())
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            heartbeat: HeartbeatConfig {
                interval: Duration::from_secs(self.tunnel.heartbeat_interval_secs),
                miss_factor: self.tunnel.heartbeat_miss_factor,
            },
            reconnect: ReconnectConfig {
                initial_backoff: Duration::from_millis(self.tunnel.reconnect_initial_backoff_ms),
                max_backoff: Duration::from_millis(self.tunnel.reconnect_max_backoff_ms),
                multiplier: self.tunnel.reconnect_multiplier,
                max_attempts: self.tunnel.reconnect_max_attempts,
                jitter: self.tunnel.reconnect_jitter,
            },
            attempt_timeout: Duration::from_secs(self.tunnel.reconnect_attempt_timeout_secs),
            queue: QueueConfig {
                capacity: self.queue.capacity,
                default_deadline: Duration::from_secs(self.queue.default_deadline_secs),
                sweep_interval: Duration::from_millis(self.queue.sweep_interval_ms),
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker.failure_threshold,
                success_threshold: self.breaker.success_threshold,
                operation_timeout: Duration::from_millis(self.breaker.operation_timeout_ms),
                reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
                half_open_max_probes: self.breaker.half_open_max_probes,
            },
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let section = &self.rate_limit;
        RateLimitConfig {
            window_limit: section.window_limit,
            window: Duration::from_secs(section.window_secs),
            burst_capacity: section.burst_capacity,
            refill_per_sec: section.refill_per_sec,
            max_concurrent: section.max_concurrent,
            exempt: section.exempt.iter().cloned().collect(),
            adaptive: AdaptiveConfig {
                enabled: section.adaptive.enabled,
                abuse_threshold: section.adaptive.abuse_threshold,
                abuse_window: Duration::from_secs(section.adaptive.abuse_window_secs),
                tighten_factor: section.adaptive.tighten_factor,
                cooldown: Duration::from_secs(section.adaptive.cooldown_secs),
            },
            ..RateLimitConfig::default()
        }
    }

    pub fn max_deadline(&self) -> Duration {
        Duration::from_secs(self.queue.max_deadline_secs)
    }

    /// Template written by `llm-relay serve --print-config`
    pub fn template() -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(&RelayConfig::default())?)
    }
}
