//! Circuit breaker for the tunnel forwarding path
//!
//! # States
//! - Closed: calls pass through; consecutive failures are counted
//! - Open: the target is assumed down, calls fail fast without running
//! - HalfOpen: a limited number of probe calls test recovery
//!
//! ```text
//! Closed   → Open:     failures >= failure_threshold
//! Open     → HalfOpen: reset_timeout elapsed (scheduled, checked lazily too)
//! HalfOpen → Closed:   successes >= success_threshold
//! HalfOpen → Open:     any probe failure
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in closed state before opening
    pub failure_threshold: u32,
    /// Consecutive probe successes in half-open state before closing
    pub success_threshold: u32,
    /// Upper bound on a single guarded operation
    pub operation_timeout: Duration,
    /// Time spent open before probing
    pub reset_timeout: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            operation_timeout: Duration::from_secs(10),
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
        }
    }
}

/// A state change, as seen by listeners
#[derive(Debug, Clone)]
pub struct Transition {
    pub target: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Observer notified after every state change
///
/// Listeners run synchronously on the task that caused the transition and
/// must not block.
pub trait TransitionListener: Send + Sync {
    fn on_transition(&self, transition: &Transition);
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("Circuit open, retry after {}ms", .retry_after.as_millis())]
    Open { retry_after: Duration },

    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("{0}")]
    Inner(E),
}

/// Read-only view of breaker counters
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip)]
    pub last_change: Instant,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    probes_in_flight: u32,
    last_change: Instant,
    /// Bumped on every transition so stale schedules and probes are ignored
    generation: u64,
}

struct Shared {
    target: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    listeners: Vec<Arc<dyn TransitionListener>>,
}

/// Per-target circuit breaker; cheap to clone
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("target", &self.shared.target)
            .field("state", &self.state())
            .finish()
    }
}

/// Generation a call was admitted under; completions from an older
/// generation are ignored
#[derive(Clone, Copy)]
struct Admission {
    generation: u64,
    probe: bool,
}

/// Releases a half-open probe slot if the guarded call is abandoned
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.lock();
            if inner.generation == self.generation && inner.probes_in_flight > 0 {
                inner.probes_in_flight -= 1;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_listeners(target, config, Vec::new())
    }

    pub fn with_listeners(
        target: impl Into<String>,
        config: CircuitBreakerConfig,
        listeners: Vec<Arc<dyn TransitionListener>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                target: target.into(),
                config,
                inner: Mutex::new(BreakerInner {
                    state: CircuitState::Closed,
                    failures: 0,
                    successes: 0,
                    probes_in_flight: 0,
                    last_change: Instant::now(),
                    generation: 0,
                }),
                listeners,
            }),
        }
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Current state, applying an overdue open → half-open transition
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.lock();
            let transition = self.maybe_half_open(&mut inner);
            (inner.state, transition)
        };
        self.notify(transition);
        state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let (snapshot, transition) = {
            let mut inner = self.lock();
            let transition = self.maybe_half_open(&mut inner);
            (
                BreakerSnapshot {
                    state: inner.state,
                    consecutive_failures: inner.failures,
                    consecutive_successes: inner.successes,
                    last_change: inner.last_change,
                },
                transition,
            )
        };
        self.notify(transition);
        snapshot
    }

    /// Run `operation` through the breaker
    ///
    /// The operation is bounded by `operation_timeout`; a timeout or an
    /// `Err` counts as a failure. While open the operation is never invoked.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit()?;

        let mut slot = admission.probe.then(|| ProbeSlot {
            breaker: self,
            generation: admission.generation,
            armed: true,
        });

        let timeout = self.shared.config.operation_timeout;
        let result = tokio::time::timeout(timeout, operation()).await;

        if let Some(slot) = slot.as_mut() {
            slot.armed = false;
        }

        match result {
            Ok(Ok(value)) => {
                self.on_success(admission);
                Ok(value)
            }
            Ok(Err(e)) => {
                self.on_failure(admission);
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                debug!(
                    "Breaker {}: operation timed out after {:?}",
                    self.shared.target, timeout
                );
                self.on_failure(admission);
                Err(BreakerError::Timeout(timeout))
            }
        }
    }

    /// Force the breaker back to closed (operator action)
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.lock();
            inner.failures = 0;
            inner.successes = 0;
            self.transition(&mut inner, CircuitState::Closed)
        };
        self.notify(transition);
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // A poisoned breaker still holds consistent counters
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn admit<E>(&self) -> Result<Admission, BreakerError<E>> {
        let (result, transition) = {
            let mut inner = self.lock();
            let transition = self.maybe_half_open(&mut inner);
            let result = match inner.state {
                CircuitState::Closed => Ok(Admission {
                    generation: inner.generation,
                    probe: false,
                }),
                CircuitState::Open => {
                    let elapsed = inner.last_change.elapsed();
                    Err(BreakerError::Open {
                        retry_after: self.shared.config.reset_timeout.saturating_sub(elapsed),
                    })
                }
                CircuitState::HalfOpen => {
                    if inner.probes_in_flight < self.shared.config.half_open_max_probes {
                        inner.probes_in_flight += 1;
                        Ok(Admission {
                            generation: inner.generation,
                            probe: true,
                        })
                    } else {
                        Err(BreakerError::Open {
                            retry_after: self.shared.config.operation_timeout,
                        })
                    }
                }
            };
            (result, transition)
        };
        self.notify(transition);
        result
    }

    fn on_success(&self, admission: Admission) {
        let transition = {
            let mut inner = self.lock();
            if inner.generation != admission.generation {
                // Breaker moved on while the call ran
                return;
            }
            if admission.probe {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.failures = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.shared.config.success_threshold {
                        inner.failures = 0;
                        inner.successes = 0;
                        self.transition(&mut inner, CircuitState::Closed)
                    } else {
                        None
                    }
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    fn on_failure(&self, admission: Admission) {
        let transition = {
            let mut inner = self.lock();
            if inner.generation != admission.generation {
                return;
            }
            if admission.probe {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.failures += 1;
                    if inner.failures >= self.shared.config.failure_threshold {
                        self.open(&mut inner)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    inner.successes = 0;
                    self.open(&mut inner)
                }
                CircuitState::Open => None,
            }
        };
        self.notify(transition);
    }

    fn open(&self, inner: &mut BreakerInner) -> Option<Transition> {
        let transition = self.transition(inner, CircuitState::Open);
        self.schedule_half_open(inner.generation);
        transition
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) -> Option<Transition> {
        if inner.state == CircuitState::Open
            && inner.last_change.elapsed() >= self.shared.config.reset_timeout
        {
            self.transition(inner, CircuitState::HalfOpen)
        } else {
            None
        }
    }

    fn schedule_half_open(&self, generation: u64) {
        // Outside a runtime the lazy check in `state`/`execute` still applies
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.shared);
        let delay = self.shared.config.reset_timeout;
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let breaker = CircuitBreaker { shared };
            let transition = {
                let mut inner = breaker.lock();
                if inner.generation == generation && inner.state == CircuitState::Open {
                    breaker.transition(&mut inner, CircuitState::HalfOpen)
                } else {
                    None
                }
            };
            breaker.notify(transition);
        });
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) -> Option<Transition> {
        let from = inner.state;
        if from == to {
            return None;
        }

        inner.state = to;
        inner.last_change = Instant::now();
        inner.generation += 1;
        inner.probes_in_flight = 0;

        match to {
            CircuitState::Open => warn!(
                "⚡ Breaker {} opened ({} -> {})",
                self.shared.target,
                from.as_str(),
                to.as_str()
            ),
            _ => info!(
                "Breaker {}: {} -> {}",
                self.shared.target,
                from.as_str(),
                to.as_str()
            ),
        }

        Some(Transition {
            target: self.shared.target.clone(),
            from,
            to,
            at: Utc::now(),
        })
    }

    fn notify(&self, transition: Option<Transition>) {
        if let Some(transition) = transition {
            for listener in &self.shared.listeners {
                listener.on_transition(&transition);
            }
        }
    }
}
