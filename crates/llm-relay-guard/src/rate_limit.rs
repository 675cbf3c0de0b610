//! Per-identity rate limiting
//!
//! Three controls apply to every identity (user id or client IP):
//!
//! - a fixed window: at most `window_limit` requests per `window`
//! - a burst token bucket: `burst_capacity` tokens refilled at `refill_per_sec`
//! - an in-flight cap: at most `max_concurrent` requests holding a [`Permit`]
//!
//! A request is admitted only if every control admits it. The decision and
//! the commit happen under the identity's map entry lock, so a denial
//! consumes nothing and concurrent checks for one identity cannot overshoot.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditSink, TracingAuditSink};

/// Retry hint when only the in-flight cap binds; no clock tells us when a
/// slot frees up
const CONCURRENCY_RETRY_HINT: Duration = Duration::from_secs(1);

/// Which control denied a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitControl {
    Window,
    Burst,
    Concurrency,
}

impl LimitControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitControl::Window => "window",
            LimitControl::Burst => "burst",
            LimitControl::Concurrency => "concurrency",
        }
    }
}

/// Adaptive tightening under detected abuse
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Violations within `abuse_window` that trigger tightening
    pub abuse_threshold: u32,
    pub abuse_window: Duration,
    /// Multiplier (0, 1] applied to every limit while tightened
    pub tighten_factor: f64,
    /// Quiet period without violations before limits are restored
    pub cooldown: Duration,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            abuse_threshold: 20,
            abuse_window: Duration::from_secs(60),
            tighten_factor: 0.5,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window_limit: u32,
    pub window: Duration,
    pub burst_capacity: u32,
    pub refill_per_sec: f64,
    pub max_concurrent: u32,
    /// Identities that bypass every control
    pub exempt: HashSet<String>,
    pub adaptive: AdaptiveConfig,
    /// Bound on the in-memory violation history
    pub violation_history: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_limit: 120,
            window: Duration::from_secs(60),
            burst_capacity: 20,
            refill_per_sec: 2.0,
            max_concurrent: 8,
            exempt: HashSet::new(),
            adaptive: AdaptiveConfig::default(),
            violation_history: 1024,
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_window(mut self, limit: u32, window: Duration) -> Self {
        self.window_limit = limit;
        self.window = window;
        self
    }

    #[must_use]
    pub fn with_burst(mut self, capacity: u32, refill_per_sec: f64) -> Self {
        self.burst_capacity = capacity;
        self.refill_per_sec = refill_per_sec;
        self
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max: u32) -> Self {
        self.max_concurrent = max;
        self
    }

    #[must_use]
    pub fn with_exempt(mut self, identity: impl Into<String>) -> Self {
        self.exempt.insert(identity.into());
        self
    }

    #[must_use]
    pub fn with_adaptive(mut self, adaptive: AdaptiveConfig) -> Self {
        self.adaptive = adaptive;
        self
    }

    #[must_use]
    pub fn without_adaptive(mut self) -> Self {
        self.adaptive.enabled = false;
        self
    }
}

/// Limits in force for one identity
struct Limits {
    window_limit: u32,
    burst_capacity: f64,
    refill_per_sec: f64,
    max_concurrent: u32,
}

impl Limits {
    fn from_config(config: &RateLimitConfig, tightened: bool) -> Self {
        let factor = if tightened {
            config.adaptive.tighten_factor.clamp(f64::MIN_POSITIVE, 1.0)
        } else {
            1.0
        };
        // Tightening never drops a limit below 1; a zero limit stays zero
        let scale = |v: u32| ((v as f64 * factor).floor() as u32).max(v.min(1));
        Self {
            window_limit: scale(config.window_limit),
            burst_capacity: scale(config.burst_capacity) as f64,
            refill_per_sec: config.refill_per_sec * factor,
            max_concurrent: scale(config.max_concurrent),
        }
    }
}

/// Request denied by the limiter
#[derive(Debug, Clone, Error, PartialEq)]
#[error("Rate limit exceeded ({}), retry after {}ms", .control.as_str(), .retry_after.as_millis())]
pub struct RateLimitDenied {
    /// The binding control (the one with the longest wait)
    pub control: LimitControl,
    pub retry_after: Duration,
}

/// A recorded denial
#[derive(Debug, Clone, Serialize)]
pub struct ViolationRecord {
    pub identity: String,
    pub endpoint: String,
    pub control: LimitControl,
    pub at: DateTime<Utc>,
}

/// Admission token; dropping it releases the in-flight slot exactly once
#[derive(Debug)]
pub struct Permit {
    slot: Option<Arc<AtomicU32>>,
}

impl Permit {
    fn exempt() -> Self {
        Self { slot: None }
    }

    pub fn is_exempt(&self) -> bool {
        self.slot.is_none()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            // Never below zero even if counters were reset underneath
            let _ = slot.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
        }
    }
}

struct IdentityWindow {
    window_start: Instant,
    window_count: u32,
    tokens: f64,
    last_refill: Instant,
    in_flight: Arc<AtomicU32>,
    recent_violations: VecDeque<Instant>,
    last_violation: Option<Instant>,
    tightened: bool,
    last_seen: Instant,
}

impl IdentityWindow {
    fn new(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            window_start: now,
            window_count: 0,
            tokens: config.burst_capacity as f64,
            last_refill: now,
            in_flight: Arc::new(AtomicU32::new(0)),
            recent_violations: VecDeque::new(),
            last_violation: None,
            tightened: false,
            last_seen: now,
        }
    }

    fn refill(&mut self, limits: &Limits, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * limits.refill_per_sec).min(limits.burst_capacity);
        self.last_refill = now;
    }

    fn roll_window(&mut self, window: Duration, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= window {
            self.window_start = now;
            self.window_count = 0;
        }
    }
}

/// Per-identity admission control
pub struct RateLimiter {
    config: RwLock<Arc<RateLimitConfig>>,
    windows: DashMap<String, IdentityWindow>,
    violations: Mutex<VecDeque<ViolationRecord>>,
    audit: Arc<dyn AuditSink>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_audit(config, Arc::new(TracingAuditSink))
    }

    pub fn with_audit(config: RateLimitConfig, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            windows: DashMap::new(),
            violations: Mutex::new(VecDeque::new()),
            audit,
        }
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap limits; existing windows keep their counters
    pub fn update_config(&self, config: RateLimitConfig) {
        info!(
            "Rate limits updated: {}/{:?}, burst {} @ {}/s, {} concurrent",
            config.window_limit,
            config.window,
            config.burst_capacity,
            config.refill_per_sec,
            config.max_concurrent
        );
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(config);
    }

    /// Admit or deny one request from `identity` against `endpoint`
    pub fn check(&self, identity: &str, endpoint: &str) -> Result<Permit, RateLimitDenied> {
        let config = self.config();
        if config.exempt.contains(identity) {
            return Ok(Permit::exempt());
        }

        let now = Instant::now();
        let mut entry = self
            .windows
            .entry(identity.to_string())
            .or_insert_with(|| IdentityWindow::new(&config, now));
        let window = entry.value_mut();
        window.last_seen = now;

        if window.tightened {
            let quiet = window
                .last_violation
                .map(|at| now.saturating_duration_since(at) >= config.adaptive.cooldown)
                .unwrap_or(true);
            if quiet || !config.adaptive.enabled {
                window.tightened = false;
                info!("Limits restored for {}", identity);
                self.audit.record(AuditEvent::RateLimitRelaxed {
                    identity: identity.to_string(),
                    at: Utc::now(),
                });
            }
        }

        let limits = Limits::from_config(&config, window.tightened);
        window.roll_window(config.window, now);
        window.refill(&limits, now);

        let mut denied: Option<RateLimitDenied> = None;
        let mut deny = |control: LimitControl, retry_after: Duration| {
            let longer = denied
                .as_ref()
                .map(|d| retry_after > d.retry_after)
                .unwrap_or(true);
            if longer {
                denied = Some(RateLimitDenied {
                    control,
                    retry_after,
                });
            }
        };

        if window.window_count >= limits.window_limit {
            let reset_at = window.window_start + config.window;
            deny(
                LimitControl::Window,
                reset_at.saturating_duration_since(now),
            );
        }

        if window.tokens < 1.0 {
            let wait = if limits.refill_per_sec > 0.0 {
                Duration::try_from_secs_f64((1.0 - window.tokens) / limits.refill_per_sec)
                    .unwrap_or(config.window)
            } else {
                config.window
            };
            deny(LimitControl::Burst, wait);
        }

        if window.in_flight.load(Ordering::Acquire) >= limits.max_concurrent {
            deny(LimitControl::Concurrency, CONCURRENCY_RETRY_HINT);
        }

        if let Some(denial) = denied {
            self.record_violation(identity, endpoint, &denial, window, &config, now);
            return Err(denial);
        }

        window.window_count += 1;
        window.tokens -= 1.0;
        window.in_flight.fetch_add(1, Ordering::AcqRel);

        Ok(Permit {
            slot: Some(window.in_flight.clone()),
        })
    }

    fn record_violation(
        &self,
        identity: &str,
        endpoint: &str,
        denial: &RateLimitDenied,
        window: &mut IdentityWindow,
        config: &RateLimitConfig,
        now: Instant,
    ) {
        debug!(
            "Rate limit denied {} on {} ({}, retry in {:?})",
            identity,
            endpoint,
            denial.control.as_str(),
            denial.retry_after
        );

        window.last_violation = Some(now);
        window.recent_violations.push_back(now);
        while let Some(front) = window.recent_violations.front() {
            if now.saturating_duration_since(*front) > config.adaptive.abuse_window {
                window.recent_violations.pop_front();
            } else {
                break;
            }
        }

        if config.adaptive.enabled
            && !window.tightened
            && window.recent_violations.len() as u32 >= config.adaptive.abuse_threshold
        {
            window.tightened = true;
            let limits = Limits::from_config(config, true);
            window.tokens = window.tokens.min(limits.burst_capacity);
            warn!(
                "🚨 Abuse detected for {} ({} violations), tightening limits by {}",
                identity,
                window.recent_violations.len(),
                config.adaptive.tighten_factor
            );
            self.audit.record(AuditEvent::RateLimitTightened {
                identity: identity.to_string(),
                factor: config.adaptive.tighten_factor,
                at: Utc::now(),
            });
        }

        self.audit.record(AuditEvent::violation(
            identity,
            endpoint,
            denial.control.as_str(),
            denial.retry_after,
        ));

        let mut history = self
            .violations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        history.push_back(ViolationRecord {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
            control: denial.control,
            at: Utc::now(),
        });
        while history.len() > config.violation_history {
            history.pop_front();
        }
    }

    /// Most recent violations, newest last
    pub fn recent_violations(&self, limit: usize) -> Vec<ViolationRecord> {
        let history = self
            .violations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Requests currently holding a permit for `identity`
    pub fn in_flight(&self, identity: &str) -> u32 {
        self.windows
            .get(identity)
            .map(|w| w.in_flight.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn is_tightened(&self, identity: &str) -> bool {
        self.windows
            .get(identity)
            .map(|w| w.tightened)
            .unwrap_or(false)
    }

    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }

    /// Forget identities idle for longer than `max_idle` (and at least one
    /// window) that hold no permits
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let config = self.config();
        let idle = max_idle.max(config.window);
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            now.saturating_duration_since(window.last_seen) < idle
                || window.in_flight.load(Ordering::Acquire) > 0
        });
        let pruned = before.saturating_sub(self.windows.len());
        if pruned > 0 {
            debug!("Pruned {} idle rate limit windows", pruned);
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MemorySink {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl AuditSink for MemorySink {
        fn record(&self, event: AuditEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn window_only(limit: u32, window: Duration) -> RateLimitConfig {
        RateLimitConfig::new()
            .with_window(limit, window)
            .with_burst(1000, 1000.0)
            .with_max_concurrent(1000)
            .without_adaptive()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window_denies_over_limit_then_resumes() {
        let limiter = RateLimiter::new(window_only(3, Duration::from_secs(10)));

        for _ in 0..3 {
            assert!(limiter.check("alice", "/proxy").is_ok());
        }

        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Window);
        assert_eq!(denied.retry_after, Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(limiter.check("alice", "/proxy").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_refills_one_per_second() {
        let config = RateLimitConfig::new()
            .with_window(1000, Duration::from_secs(60))
            .with_burst(5, 1.0)
            .with_max_concurrent(1000)
            .without_adaptive();
        let limiter = RateLimiter::new(config);

        for _ in 0..5 {
            assert!(limiter.check("alice", "/proxy").is_ok());
        }
        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Burst);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("alice", "/proxy").is_ok());
        assert!(limiter.check("alice", "/proxy").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_consumes_nothing() {
        let config = RateLimitConfig::new()
            .with_window(2, Duration::from_secs(60))
            .with_burst(1, 1.0)
            .with_max_concurrent(1000)
            .without_adaptive();
        let limiter = RateLimiter::new(config);

        assert!(limiter.check("alice", "/proxy").is_ok());
        // Burst denies; the window count must not move
        assert!(limiter.check("alice", "/proxy").is_err());
        assert!(limiter.check("alice", "/proxy").is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.check("alice", "/proxy").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_is_longest_binding_wait() {
        let config = RateLimitConfig::new()
            .with_window(1, Duration::from_secs(30))
            .with_burst(1, 1.0)
            .with_max_concurrent(1000)
            .without_adaptive();
        let limiter = RateLimiter::new(config);

        assert!(limiter.check("alice", "/proxy").is_ok());
        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Window);
        assert_eq!(denied.retry_after, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permit_drop_releases_slot_once() {
        let config = RateLimitConfig::new()
            .with_window(100, Duration::from_secs(60))
            .with_burst(100, 100.0)
            .with_max_concurrent(2)
            .without_adaptive();
        let limiter = RateLimiter::new(config);

        let first = limiter.check("alice", "/proxy").unwrap();
        let _second = limiter.check("alice", "/proxy").unwrap();
        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Concurrency);
        assert_eq!(limiter.in_flight("alice"), 2);

        drop(first);
        assert_eq!(limiter.in_flight("alice"), 1);
        assert!(limiter.check("alice", "/proxy").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exempt_identity_bypasses_limits() {
        let limiter = RateLimiter::new(window_only(1, Duration::from_secs(60)).with_exempt("ops"));

        for _ in 0..10 {
            let permit = limiter.check("ops", "/proxy").unwrap();
            assert!(permit.is_exempt());
        }
        assert_eq!(limiter.tracked_identities(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_identities_are_independent() {
        let limiter = RateLimiter::new(window_only(1, Duration::from_secs(60)));

        assert!(limiter.check("alice", "/proxy").is_ok());
        assert!(limiter.check("alice", "/proxy").is_err());
        assert!(limiter.check("bob", "/proxy").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_tightening_and_cooldown() {
        let sink = Arc::new(MemorySink::default());
        let config = RateLimitConfig::new()
            .with_window(1000, Duration::from_secs(60))
            .with_burst(4, 0.5)
            .with_max_concurrent(1000)
            .with_adaptive(AdaptiveConfig {
                enabled: true,
                abuse_threshold: 3,
                abuse_window: Duration::from_secs(60),
                tighten_factor: 0.5,
                cooldown: Duration::from_secs(30),
            });
        let limiter = RateLimiter::with_audit(config, sink.clone());

        for _ in 0..4 {
            assert!(limiter.check("mallory", "/proxy").is_ok());
        }
        for _ in 0..3 {
            assert!(limiter.check("mallory", "/proxy").is_err());
        }
        assert!(limiter.is_tightened("mallory"));

        // Quiet period restores normal limits
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check("mallory", "/proxy").is_ok());
        assert!(!limiter.is_tightened("mallory"));

        let events = sink.events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::RateLimitTightened { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, AuditEvent::RateLimitRelaxed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_violation_history_is_bounded() {
        let mut config = window_only(1, Duration::from_secs(60));
        config.violation_history = 3;
        let limiter = RateLimiter::new(config);

        assert!(limiter.check("alice", "/a").is_ok());
        for i in 0..5 {
            let _ = limiter.check("alice", &format!("/v{}", i));
        }

        let recent = limiter.recent_violations(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().endpoint, "/v4");
        assert_eq!(limiter.recent_violations(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_idle_keeps_identities_with_permits() {
        let limiter = RateLimiter::new(window_only(10, Duration::from_secs(5)));

        let held = limiter.check("alice", "/proxy").unwrap();
        drop(limiter.check("bob", "/proxy").unwrap());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(limiter.prune_idle(Duration::from_secs(10)), 1);
        assert_eq!(limiter.tracked_identities(), 1);
        drop(held);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_config_applies_to_next_check() {
        let limiter = RateLimiter::new(window_only(1, Duration::from_secs(60)));

        assert!(limiter.check("alice", "/proxy").is_ok());
        assert!(limiter.check("alice", "/proxy").is_err());

        limiter.update_config(window_only(5, Duration::from_secs(60)));
        assert!(limiter.check("alice", "/proxy").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_never_overshoot() {
        let limiter = Arc::new(RateLimiter::new(window_only(50, Duration::from_secs(600))));
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = 0;
                for _ in 0..20 {
                    if limiter.check("alice", "/proxy").is_ok() {
                        admitted += 1;
                    }
                }
                admitted
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_falls_back_to_window_hint() {
        let config = RateLimitConfig::new()
            .with_window(1000, Duration::from_secs(60))
            .with_burst(1, 1e-20)
            .with_max_concurrent(1000)
            .without_adaptive();
        let limiter = RateLimiter::new(config);

        assert!(limiter.check("alice", "/proxy").is_ok());
        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Burst);
        assert_eq!(denied.retry_after, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_limits_admit_nothing() {
        let limiter = RateLimiter::new(window_only(0, Duration::from_secs(60)));
        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Window);

        let config = RateLimitConfig::new()
            .with_window(1000, Duration::from_secs(60))
            .with_burst(1000, 1000.0)
            .with_max_concurrent(0)
            .without_adaptive();
        let limiter = RateLimiter::new(config);
        let denied = limiter.check("alice", "/proxy").unwrap_err();
        assert_eq!(denied.control, LimitControl::Concurrency);
    }

    #[test]
    fn test_tightening_keeps_positive_limits_at_least_one() {
        let config = RateLimitConfig::new()
            .with_window(1, Duration::from_secs(60))
            .with_burst(0, 1.0)
            .with_max_concurrent(3)
            .with_adaptive(AdaptiveConfig {
                tighten_factor: 0.1,
                ..AdaptiveConfig::default()
            });

        let limits = Limits::from_config(&config, true);
        assert_eq!(limits.window_limit, 1);
        assert_eq!(limits.burst_capacity, 0.0);
        assert_eq!(limits.max_concurrent, 1);
    }
}
