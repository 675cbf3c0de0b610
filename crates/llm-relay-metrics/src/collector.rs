//! Metrics collector shared by every relay component

use llm_relay_proto::ErrorCode;
use prometheus::core::Collector;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;
use std::time::Duration;

/// Upper bounds (seconds) of the latency buckets. Model generation can run
/// for minutes, so the tail is wide.
pub const LATENCY_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
];

/// Final outcome of a proxied request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The agent produced a response (any HTTP status)
    Success,
    /// The relay answered with an error
    Failed(ErrorCode),
}

impl RequestOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Failed(code) => code.as_str(),
        }
    }

    fn all() -> impl Iterator<Item = RequestOutcome> {
        std::iter::once(RequestOutcome::Success)
            .chain(ErrorCode::ALL.into_iter().map(RequestOutcome::Failed))
    }
}

/// Circuit breaker state as exported on the gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateGauge {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl BreakerStateGauge {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerStateGauge::Closed => "closed",
            BreakerStateGauge::HalfOpen => "half_open",
            BreakerStateGauge::Open => "open",
        }
    }

    fn from_value(value: i64) -> Self {
        match value {
            1 => BreakerStateGauge::HalfOpen,
            2 => BreakerStateGauge::Open,
            _ => BreakerStateGauge::Closed,
        }
    }
}

/// Prometheus series for the relay, held in a private registry
pub struct MetricsCollector {
    registry: Registry,
    requests: IntCounterVec,
    errors: IntCounterVec,
    rate_limit_violations: IntCounterVec,
    breaker_transitions: IntCounterVec,
    active_tunnels: IntGauge,
    queue_depth: IntGaugeVec,
    breaker_state: IntGaugeVec,
    latency: Histogram,
}

impl MetricsCollector {
    pub fn new() -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("llm_relay_requests_total", "Proxied requests by outcome"),
            &["outcome"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("llm_relay_errors_total", "Errors by category"),
            &["code"],
        )?;
        let rate_limit_violations = IntCounterVec::new(
            Opts::new(
                "llm_relay_rate_limit_violations_total",
                "Rate limit denials by control",
            ),
            &["control"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new(
                "llm_relay_breaker_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["from", "to"],
        )?;
        let active_tunnels =
            IntGauge::new("llm_relay_active_tunnels", "Tunnels currently registered")?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("llm_relay_queue_depth", "Queued requests per tunnel"),
            &["tunnel"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "llm_relay_breaker_state",
                "Circuit breaker state (0 closed, 1 half_open, 2 open)",
            ),
            &["target"],
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "llm_relay_request_duration_seconds",
                "End-to-end proxied request latency",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
        )?;

        let registry = Registry::new();
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(rate_limit_violations.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(active_tunnels.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        // Export every outcome and error code from the start, at zero
        for outcome in RequestOutcome::all() {
            requests.with_label_values(&[outcome.label()]);
        }
        for code in ErrorCode::ALL {
            errors.with_label_values(&[code.as_str()]);
        }

        Ok(Self {
            registry,
            requests,
            errors,
            rate_limit_violations,
            breaker_transitions,
            active_tunnels,
            queue_depth,
            breaker_state,
            latency,
        })
    }

    /// Record a finished proxied request and its end-to-end latency
    pub fn record_request(&self, outcome: RequestOutcome, latency: Duration) {
        self.requests.with_label_values(&[outcome.label()]).inc();
        self.latency.observe(latency.as_secs_f64());
    }

    /// Count an error by category (handshake and protocol errors included)
    pub fn record_error(&self, code: ErrorCode) {
        self.errors.with_label_values(&[code.as_str()]).inc();
    }

    pub fn record_rate_limit_violation(&self, control: &str) {
        self.rate_limit_violations
            .with_label_values(&[control])
            .inc();
    }

    pub fn record_breaker_transition(
        &self,
        target: &str,
        from: BreakerStateGauge,
        to: BreakerStateGauge,
    ) {
        self.breaker_transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        self.set_breaker_state(target, to);
    }

    pub fn set_breaker_state(&self, target: &str, state: BreakerStateGauge) {
        self.breaker_state
            .with_label_values(&[target])
            .set(state as i64);
    }

    pub fn tunnel_opened(&self) {
        self.active_tunnels.inc();
    }

    pub fn tunnel_dropped(&self, tunnel_id: &str) {
        self.active_tunnels.dec();
        self.forget_tunnel(tunnel_id);
    }

    /// Remove the per-tunnel series without touching the tunnel count
    pub fn forget_tunnel(&self, tunnel_id: &str) {
        // Absent series are fine: the tunnel may never have reported
        let _ = self.queue_depth.remove_label_values(&[tunnel_id]);
        let _ = self.breaker_state.remove_label_values(&[tunnel_id]);
    }

    pub fn set_queue_depth(&self, tunnel_id: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[tunnel_id])
            .set(depth as i64);
    }

    pub fn active_tunnels(&self) -> i64 {
        self.active_tunnels.get()
    }

    pub fn requests(&self, outcome: RequestOutcome) -> u64 {
        self.requests.with_label_values(&[outcome.label()]).get()
    }

    pub fn errors(&self, code: ErrorCode) -> u64 {
        self.errors.with_label_values(&[code.as_str()]).get()
    }

    pub fn rate_limit_violations(&self, control: &str) -> u64 {
        self.rate_limit_violations
            .with_label_values(&[control])
            .get()
    }

    pub fn breaker_transitions(&self, from: &str, to: &str) -> u64 {
        self.breaker_transitions.with_label_values(&[from, to]).get()
    }

    pub fn breaker_state(&self, target: &str) -> Option<BreakerStateGauge> {
        gauge_value(&self.breaker_state, target).map(BreakerStateGauge::from_value)
    }

    pub fn queue_depth(&self, tunnel_id: &str) -> Option<i64> {
        gauge_value(&self.queue_depth, tunnel_id)
    }

    pub fn latency_count(&self) -> u64 {
        self.latency.get_sample_count()
    }

    pub fn latency_sum_seconds(&self) -> f64 {
        self.latency.get_sample_sum()
    }

    /// Encode every registered series in the Prometheus text format
    pub fn encode_text(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Read a single-label gauge without creating the series
fn gauge_value(vec: &IntGaugeVec, label: &str) -> Option<i64> {
    vec.collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .find(|metric| {
            metric
                .get_label()
                .first()
                .is_some_and(|pair| pair.get_value() == label)
        })
        .map(|metric| metric.get_gauge().get_value() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_request_outcomes_are_counted_separately() {
        let metrics = MetricsCollector::new().unwrap();

        metrics.record_request(RequestOutcome::Success, Duration::from_millis(10));
        metrics.record_request(RequestOutcome::Success, Duration::from_millis(20));
        metrics.record_request(
            RequestOutcome::Failed(ErrorCode::QueueFull),
            Duration::from_millis(1),
        );

        assert_eq!(metrics.requests(RequestOutcome::Success), 2);
        assert_eq!(
            metrics.requests(RequestOutcome::Failed(ErrorCode::QueueFull)),
            1
        );
        assert_eq!(metrics.latency_count(), 3);
        assert!((metrics.latency_sum_seconds() - 0.031).abs() < 1e-9);
    }

    #[test]
    fn test_tunnel_drop_clears_per_tunnel_series() {
        let metrics = MetricsCollector::new().unwrap();

        metrics.tunnel_opened();
        metrics.set_queue_depth("t-1", 4);
        metrics.set_breaker_state("t-1", BreakerStateGauge::Open);
        assert_eq!(metrics.queue_depth("t-1"), Some(4));
        assert_eq!(metrics.breaker_state("t-1"), Some(BreakerStateGauge::Open));

        metrics.tunnel_dropped("t-1");
        assert_eq!(metrics.active_tunnels(), 0);
        assert_eq!(metrics.queue_depth("t-1"), None);
        assert_eq!(metrics.breaker_state("t-1"), None);
        assert!(!metrics.encode_text().unwrap().contains("t-1"));
    }

    #[test]
    fn test_forget_unknown_tunnel_is_harmless() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.forget_tunnel("never-seen");
        assert_eq!(metrics.queue_depth("never-seen"), None);
    }

    #[test]
    fn test_breaker_transition_updates_gauge() {
        let metrics = MetricsCollector::new().unwrap();

        metrics.record_breaker_transition(
            "t-1",
            BreakerStateGauge::Closed,
            BreakerStateGauge::Open,
        );
        metrics.record_breaker_transition(
            "t-1",
            BreakerStateGauge::Open,
            BreakerStateGauge::HalfOpen,
        );

        assert_eq!(metrics.breaker_transitions("closed", "open"), 1);
        assert_eq!(metrics.breaker_transitions("open", "half_open"), 1);
        assert_eq!(
            metrics.breaker_state("t-1"),
            Some(BreakerStateGauge::HalfOpen)
        );
    }

    #[test]
    fn test_text_exposition_contains_all_families() {
        let metrics = MetricsCollector::new().unwrap();
        metrics.tunnel_opened();
        metrics.record_request(RequestOutcome::Success, Duration::from_millis(40));
        metrics.record_request(
            RequestOutcome::Failed(ErrorCode::CircuitOpen),
            Duration::from_millis(1),
        );
        metrics.record_rate_limit_violation("window");
        metrics.set_queue_depth("t-1", 2);
        metrics.record_breaker_transition(
            "t-1",
            BreakerStateGauge::Closed,
            BreakerStateGauge::Open,
        );

        let text = metrics.encode_text().unwrap();

        assert!(text.contains("# TYPE llm_relay_requests_total counter"));
        assert!(text.contains("llm_relay_requests_total{outcome=\"success\"} 1"));
        assert!(text.contains("llm_relay_requests_total{outcome=\"CIRCUIT_OPEN\"} 1"));
        assert!(text.contains("llm_relay_requests_total{outcome=\"QUEUE_FULL\"} 0"));
        assert!(text.contains("llm_relay_rate_limit_violations_total{control=\"window\"} 1"));
        assert!(text.contains(
            "llm_relay_breaker_transitions_total{from=\"closed\",to=\"open\"} 1"
        ));
        assert!(text.contains("llm_relay_active_tunnels 1"));
        assert!(text.contains("llm_relay_queue_depth{tunnel=\"t-1\"} 2"));
        assert!(text.contains("llm_relay_breaker_state{target=\"t-1\"} 2"));
        assert!(text.contains("# TYPE llm_relay_request_duration_seconds histogram"));
        assert!(text.contains("llm_relay_request_duration_seconds_bucket{le=\"+Inf\"} 2"));
        assert!(text.contains("llm_relay_request_duration_seconds_count 2"));
    }

    #[test]
    fn test_collectors_do_not_share_series() {
        let first = MetricsCollector::new().unwrap();
        let second = MetricsCollector::new().unwrap();

        first.tunnel_opened();
        assert_eq!(first.active_tunnels(), 1);
        assert_eq!(second.active_tunnels(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let mut handles = vec![];

        for _ in 0..8 {
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..1000 {
                    metrics.record_error(ErrorCode::RequestTimeout);
                    metrics.record_rate_limit_violation("burst");
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(metrics.errors(ErrorCode::RequestTimeout), 8000);
        assert_eq!(metrics.rate_limit_violations("burst"), 8000);
    }
}
