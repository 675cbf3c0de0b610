//! Breaker transition listeners wired into every tunnel

use llm_relay_guard::{AuditEvent, AuditSink, CircuitState, Transition, TransitionListener};
use llm_relay_metrics::{BreakerStateGauge, MetricsCollector};
use std::sync::Arc;

pub fn gauge_for(state: CircuitState) -> BreakerStateGauge {
    match state {
        CircuitState::Closed => BreakerStateGauge::Closed,
        CircuitState::HalfOpen => BreakerStateGauge::HalfOpen,
        CircuitState::Open => BreakerStateGauge::Open,
    }
}

/// Feeds the breaker gauge and transition counter
pub struct MetricsTransitionListener {
    metrics: Arc<MetricsCollector>,
}

impl MetricsTransitionListener {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }
}

impl TransitionListener for MetricsTransitionListener {
    fn on_transition(&self, transition: &Transition) {
        self.metrics.record_breaker_transition(
            &transition.target,
            gauge_for(transition.from),
            gauge_for(transition.to),
        );
    }
}

/// Appends every transition to the audit log
pub struct AuditTransitionListener {
    sink: Arc<dyn AuditSink>,
}

impl AuditTransitionListener {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }
}

impl TransitionListener for AuditTransitionListener {
    fn on_transition(&self, transition: &Transition) {
        self.sink.record(AuditEvent::BreakerTransition {
            target: transition.target.clone(),
            from: transition.from.as_str(),
            to: transition.to.as_str(),
            at: transition.at,
        });
    }
}
