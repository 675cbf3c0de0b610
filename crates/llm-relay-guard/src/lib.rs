//! Admission control and fault isolation
//!
//! - [`circuit_breaker`]: per-target breaker wrapping the forwarding step
//! - [`rate_limit`]: per-identity fixed window, token bucket and in-flight cap
//! - [`audit`]: append-only sink for security-relevant events

pub mod audit;
pub mod circuit_breaker;
pub mod rate_limit;

pub use audit::{AuditEvent, AuditSink, TracingAuditSink};
pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    Transition, TransitionListener,
};
pub use rate_limit::{
    AdaptiveConfig, LimitControl, Permit, RateLimitConfig, RateLimitDenied, RateLimiter,
    ViolationRecord,
};
