//! Audit log sink

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Security-relevant event worth keeping in an append-only log
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    RateLimitViolation {
        identity: String,
        endpoint: String,
        control: &'static str,
        retry_after_ms: u64,
        at: DateTime<Utc>,
    },
    RateLimitTightened {
        identity: String,
        factor: f64,
        at: DateTime<Utc>,
    },
    RateLimitRelaxed {
        identity: String,
        at: DateTime<Utc>,
    },
    BreakerTransition {
        target: String,
        from: &'static str,
        to: &'static str,
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn violation(
        identity: &str,
        endpoint: &str,
        control: &'static str,
        retry_after: Duration,
    ) -> Self {
        AuditEvent::RateLimitViolation {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
            control,
            retry_after_ms: retry_after.as_millis() as u64,
            at: Utc::now(),
        }
    }
}

/// Append-only destination for audit events
///
/// Called on hot paths, so implementations must not block.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the `llm_relay::audit` tracing target
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::RateLimitViolation {
                identity,
                endpoint,
                control,
                retry_after_ms,
                ..
            } => {
                warn!(
                    target: "llm_relay::audit",
                    identity = %identity,
                    endpoint = %endpoint,
                    control,
                    retry_after_ms,
                    "Rate limit violation"
                );
            }
            AuditEvent::RateLimitTightened { identity, factor, .. } => {
                warn!(
                    target: "llm_relay::audit",
                    identity = %identity,
                    factor,
                    "Limits tightened after repeated violations"
                );
            }
            AuditEvent::RateLimitRelaxed { identity, .. } => {
                info!(
                    target: "llm_relay::audit",
                    identity = %identity,
                    "Limits restored"
                );
            }
            AuditEvent::BreakerTransition { target, from, to, .. } => {
                info!(
                    target: "llm_relay::audit",
                    breaker = %target,
                    from,
                    to,
                    "Circuit breaker transition"
                );
            }
        }
    }
}
