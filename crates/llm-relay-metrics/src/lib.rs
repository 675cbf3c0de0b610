//! Metrics collection for the relay
//!
//! Counters, gauges and a latency histogram fed by the rate limiter, circuit
//! breakers, registry and proxy path, kept in a per-relay Prometheus
//! registry and exposed through [`MetricsCollector::encode_text`].

pub mod collector;

pub use collector::{BreakerStateGauge, MetricsCollector, RequestOutcome, LATENCY_BUCKETS};
pub use prometheus::{Error as MetricsError, TEXT_FORMAT};
