//! Relay façade
//!
//! Wires the admission path together: rate limiter, registry lookup, queue
//! submit and response wait, recording metrics for every outcome.

use llm_relay_auth::AuthValidator;
use llm_relay_control::{Priority, ProxyError, TunnelRegistry};
use llm_relay_guard::{AuditSink, CircuitState, RateLimiter, TracingAuditSink};
use llm_relay_metrics::{MetricsCollector, MetricsError, RequestOutcome};
use llm_relay_proto::{ProxyRequest, ProxyResponse};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{RelayConfig, MAX_DEADLINE_SECS};

/// Queue fill ratio above which a tunnel counts as saturated
pub const SATURATION_THRESHOLD: f64 = 0.9;

/// One proxied call as the HTTP layer hands it over
#[derive(Debug, Clone)]
pub struct ProxyCall {
    /// Rate-limit key: token subject, or client IP for anonymous callers
    pub caller: String,
    /// Owner of the tunnel to use
    pub user_id: String,
    pub request: ProxyRequest,
    pub priority: Priority,
    /// Caller-requested deadline, capped by configuration
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub tunnels: usize,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
    pub saturated_tunnels: usize,
    pub max_queue_saturation: f64,
}

/// Time a request may spend queued and in flight
fn request_budget(requested: Option<Duration>, max: Duration, default: Duration) -> Duration {
    requested
        .map(|requested| requested.min(max))
        .unwrap_or(default)
        .min(Duration::from_secs(MAX_DEADLINE_SECS))
}

pub struct Relay {
    registry: TunnelRegistry,
    limiter: RateLimiter,
    metrics: Arc<MetricsCollector>,
    max_deadline: RwLock<Duration>,
    allow_anonymous: AtomicBool,
    draining: AtomicBool,
}

impl Relay {
    pub fn new(auth: Arc<dyn AuthValidator>, config: &RelayConfig) -> Result<Self, MetricsError> {
        Self::with_audit(auth, config, Arc::new(TracingAuditSink))
    }

    pub fn with_audit(
        auth: Arc<dyn AuthValidator>,
        config: &RelayConfig,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, MetricsError> {
        let metrics = Arc::new(MetricsCollector::new()?);
        Ok(Self {
            registry: TunnelRegistry::with_audit(
                auth,
                config.tunnel_settings(),
                metrics.clone(),
                audit.clone(),
            ),
            limiter: RateLimiter::with_audit(config.rate_limit_config(), audit),
            metrics,
            max_deadline: RwLock::new(config.max_deadline()),
            allow_anonymous: AtomicBool::new(config.server.allow_anonymous),
            draining: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous.load(Ordering::Relaxed)
    }

    /// Apply a reloaded config; live tunnels keep their settings
    pub fn apply_config(&self, config: &RelayConfig) {
        self.limiter.update_config(config.rate_limit_config());
        self.registry.apply_settings(config.tunnel_settings());
        *self
            .max_deadline
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config.max_deadline();
        self.allow_anonymous
            .store(config.server.allow_anonymous, Ordering::Relaxed);
        info!("Applied new relay configuration");
    }

    fn max_deadline(&self) -> Duration {
        *self
            .max_deadline
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forward one request through the caller's target tunnel
    pub async fn proxy(&self, call: ProxyCall) -> Result<ProxyResponse, ProxyError> {
        let started = Instant::now();
        let result = self.forward(call).await;

        let elapsed = started.elapsed();
        match &result {
            Ok(_) => self.metrics.record_request(RequestOutcome::Success, elapsed),
            Err(e) => {
                self.metrics
                    .record_request(RequestOutcome::Failed(e.code()), elapsed);
                self.metrics.record_error(e.code());
            }
        }
        result
    }

    async fn forward(&self, call: ProxyCall) -> Result<ProxyResponse, ProxyError> {
        let endpoint = format!("{} {}", call.request.method, call.request.path);

        // Held until the response (or failure) is in
        let _permit = self.limiter.check(&call.caller, &endpoint).map_err(|denied| {
            self.metrics
                .record_rate_limit_violation(denied.control.as_str());
            ProxyError::from(denied)
        })?;

        let conn = self.registry.lookup(&call.user_id).await?;
        let budget = request_budget(
            call.timeout,
            self.max_deadline(),
            conn.settings().queue.default_deadline,
        );

        let handle = conn.submit(call.request, call.priority, Instant::now() + budget)?;
        debug!(
            "Request {} from {} queued on tunnel {} ({}ms budget)",
            handle.correlation_id(),
            call.caller,
            conn.id(),
            budget.as_millis()
        );
        handle.wait().await
    }

    pub async fn readiness(&self) -> Readiness {
        let tunnels = self.registry.snapshot().await;
        let open_circuits = tunnels
            .iter()
            .filter(|t| t.breaker == CircuitState::Open)
            .count();
        let half_open_circuits = tunnels
            .iter()
            .filter(|t| t.breaker == CircuitState::HalfOpen)
            .count();
        let saturated_tunnels = tunnels
            .iter()
            .filter(|t| t.saturation() >= SATURATION_THRESHOLD)
            .count();
        let max_queue_saturation = tunnels
            .iter()
            .map(|t| t.saturation())
            .fold(0.0, f64::max);

        Readiness {
            ready: !self.draining.load(Ordering::Relaxed),
            tunnels: tunnels.len(),
            open_circuits,
            half_open_circuits,
            saturated_tunnels,
            max_queue_saturation,
        }
    }

    /// Stop reporting ready and close every tunnel
    pub async fn shutdown(&self) {
        self.draining.store(true, Ordering::Relaxed);
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_relay_auth::{Identity, StaticTokenValidator};
    use llm_relay_guard::LimitControl;
    use llm_relay_proto::ErrorCode;

    fn relay(config: &RelayConfig) -> Relay {
        let auth = StaticTokenValidator::new().with_token("alice-token", Identity::new("alice"));
        Relay::new(Arc::new(auth), config).unwrap()
    }

    fn call(caller: &str, user: &str) -> ProxyCall {
        ProxyCall {
            caller: caller.to_string(),
            user_id: user.to_string(),
            request: ProxyRequest {
                method: "GET".to_string(),
                path: "/api/tags".to_string(),
                ..Default::default()
            },
            priority: Priority::Normal,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_missing_tunnel_is_unavailable_and_counted() {
        let relay = relay(&RelayConfig::default());

        let result = relay.proxy(call("alice", "alice")).await;

        assert!(matches!(result, Err(ProxyError::TunnelUnavailable(_))));
        assert_eq!(
            relay
                .metrics()
                .requests(RequestOutcome::Failed(ErrorCode::TunnelUnavailable)),
            1
        );
        assert_eq!(relay.metrics().errors(ErrorCode::TunnelUnavailable), 1);
        // The permit was released with the failure
        assert_eq!(relay.limiter().in_flight("alice"), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_applies_before_lookup() {
        let mut config = RelayConfig::default();
        config.rate_limit.window_limit = 1;
        config.rate_limit.adaptive.enabled = false;
        let relay = relay(&config);

        let _ = relay.proxy(call("10.0.0.1", "alice")).await;
        let denied = relay.proxy(call("10.0.0.1", "alice")).await;

        match denied {
            Err(ProxyError::RateLimitExceeded { control, .. }) => {
                assert_eq!(control, LimitControl::Window)
            }
            other => panic!("expected rate limit, got {:?}", other),
        }
        assert_eq!(relay.metrics().rate_limit_violations("window"), 1);
    }

    #[test]
    fn test_request_budget_is_capped() {
        let max = Duration::from_secs(600);
        let default = Duration::from_secs(120);

        assert_eq!(request_budget(None, max, default), default);
        assert_eq!(
            request_budget(Some(Duration::from_secs(5)), max, default),
            Duration::from_secs(5)
        );
        assert_eq!(request_budget(Some(Duration::MAX), max, default), max);

        // Unvalidated configs still cannot push the deadline past a day
        let day = Duration::from_secs(MAX_DEADLINE_SECS);
        assert_eq!(request_budget(Some(Duration::MAX), Duration::MAX, default), day);
        assert_eq!(request_budget(None, max, Duration::MAX), day);
    }

    #[tokio::test]
    async fn test_readiness_reports_empty_registry() {
        let relay = relay(&RelayConfig::default());
        let readiness = relay.readiness().await;
        assert!(readiness.ready);
        assert_eq!(readiness.tunnels, 0);
        assert_eq!(readiness.max_queue_saturation, 0.0);

        relay.shutdown().await;
        assert!(!relay.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_apply_config_updates_limits() {
        let relay = relay(&RelayConfig::default());
        let mut config = RelayConfig::default();
        config.rate_limit.window_limit = 3;
        config.queue.capacity = 5;
        config.server.allow_anonymous = true;

        relay.apply_config(&config);

        assert_eq!(relay.limiter().config().window_limit, 3);
        assert_eq!(relay.registry().settings().queue.capacity, 5);
        assert!(relay.allow_anonymous());
    }
}
