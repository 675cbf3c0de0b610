//! Tunnel connection
//!
//! One persistent channel to one user's agent, together with the queue,
//! correlator and breaker that serve it. Lifecycle state is only changed by
//! the registry and the lifecycle driver it spawns.

use chrono::{DateTime, TimeZone, Utc};
use llm_relay_auth::Identity;
use llm_relay_guard::{AuditSink, CircuitBreaker, TransitionListener};
use llm_relay_metrics::{BreakerStateGauge, MetricsCollector};
use llm_relay_proto::{Envelope, ProxyRequest};
use llm_relay_transport::TunnelTransport;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::events::TunnelInfo;
use crate::observers::{AuditTransitionListener, MetricsTransitionListener};
use crate::pending_requests::{PendingRequests, ResponseHandle};
use crate::queue::{Priority, QueuedRequest, RequestQueue};
use crate::settings::TunnelSettings;
use crate::state::{InvalidTransition, TunnelState};

/// Transports handed over by `resume` while the driver waits for them
const RESUME_CHANNEL_CAPACITY: usize = 4;

pub type ResumeReceiver = mpsc::Receiver<Arc<dyn TunnelTransport>>;

pub struct TunnelConnection {
    id: String,
    identity: Identity,
    created_at: DateTime<Utc>,
    settings: TunnelSettings,
    state: watch::Sender<TunnelState>,
    last_heartbeat_ms: AtomicI64,
    reconnect_attempts: AtomicU32,
    queue: RequestQueue,
    pending: PendingRequests,
    breaker: CircuitBreaker,
    link: Mutex<Option<Arc<dyn TunnelTransport>>>,
    resume_tx: mpsc::Sender<Arc<dyn TunnelTransport>>,
    cancel: CancellationToken,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelConnection {
    pub(crate) fn new(
        identity: Identity,
        settings: TunnelSettings,
        metrics: Arc<MetricsCollector>,
        audit: Arc<dyn AuditSink>,
    ) -> (Self, ResumeReceiver) {
        let id = Uuid::new_v4().to_string();
        let listeners: Vec<Arc<dyn TransitionListener>> = vec![
            Arc::new(MetricsTransitionListener::new(metrics.clone())),
            Arc::new(AuditTransitionListener::new(audit)),
        ];
        let breaker =
            CircuitBreaker::with_listeners(id.clone(), settings.breaker.clone(), listeners);
        metrics.set_breaker_state(&id, BreakerStateGauge::Closed);
        metrics.set_queue_depth(&id, 0);

        let (state, _) = watch::channel(TunnelState::Connecting);
        let (resume_tx, resume_rx) = mpsc::channel(RESUME_CHANNEL_CAPACITY);
        let now = Utc::now();

        (
            Self {
                queue: RequestQueue::new(settings.queue.capacity),
                pending: PendingRequests::new(),
                breaker,
                id,
                identity,
                created_at: now,
                settings,
                state,
                last_heartbeat_ms: AtomicI64::new(now.timestamp_millis()),
                reconnect_attempts: AtomicU32::new(0),
                link: Mutex::new(None),
                resume_tx,
                cancel: CancellationToken::new(),
                metrics,
            },
            resume_rx,
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn settings(&self) -> &TunnelSettings {
        &self.settings
    }

    pub fn state(&self) -> TunnelState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes
    pub fn subscribe_state(&self) -> watch::Receiver<TunnelState> {
        self.state.subscribe()
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_heartbeat_ms.load(Ordering::Relaxed))
            .single()
            .unwrap_or(self.created_at)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn default_deadline(&self) -> Instant {
        Instant::now() + self.settings.queue.default_deadline
    }

    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            tunnel_id: self.id.clone(),
            user_id: self.identity.user_id.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_heartbeat: self.last_heartbeat(),
            reconnect_attempts: self.reconnect_attempts(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
            pending: self.pending.count(),
            breaker: self.breaker.state(),
        }
    }

    /// Queue a request for transmission
    ///
    /// Rejects immediately with `QueueFull` at capacity. The returned handle
    /// resolves with the agent's response, an error, or `RequestTimeout` at
    /// `deadline`.
    pub fn submit(
        &self,
        request: ProxyRequest,
        priority: Priority,
        deadline: Instant,
    ) -> Result<ResponseHandle, ProxyError> {
        self.check_accepting()?;

        let correlation_id = Uuid::new_v4().to_string();
        // Registered before queueing so a fast response always finds its waiter
        let handle = self.pending.register(&correlation_id, &self.id, deadline);

        let item = QueuedRequest {
            correlation_id: correlation_id.clone(),
            priority,
            request,
            enqueued_at: Instant::now(),
            deadline,
        };

        match self.queue.push(item) {
            Ok(depth) => self.metrics.set_queue_depth(&self.id, depth),
            Err(_) => {
                self.pending.cancel(&correlation_id);
                debug!("Queue full on tunnel {}, rejecting request", self.id);
                return Err(ProxyError::QueueFull {
                    capacity: self.queue.capacity(),
                });
            }
        }

        // A close may have released the queue after the first check
        if let Err(e) = self.check_accepting() {
            self.queue.remove(&correlation_id);
            self.pending.cancel(&correlation_id);
            return Err(e);
        }

        debug!(
            "Queued request {} on tunnel {} ({:?})",
            correlation_id, self.id, priority
        );
        Ok(handle)
    }

    /// Send an envelope on the live link; fails fast unless connected
    pub async fn send(&self, envelope: Envelope) -> Result<(), ProxyError> {
        if self.state() != TunnelState::Connected {
            return Err(ProxyError::TunnelUnavailable(format!(
                "tunnel {} is {}",
                self.id,
                self.state()
            )));
        }
        let link = self
            .current_link()
            .ok_or_else(|| ProxyError::TunnelUnavailable("no active link".to_string()))?;
        link.send(envelope)
            .await
            .map_err(|e| ProxyError::TunnelUnavailable(e.to_string()))
    }

    fn check_accepting(&self) -> Result<(), ProxyError> {
        match self.state() {
            s if s.accepts_requests() => Ok(()),
            TunnelState::Failed => Err(ProxyError::TunnelUnavailable(format!(
                "tunnel {} failed",
                self.id
            ))),
            s => Err(ProxyError::TunnelClosed(format!(
                "tunnel {} is {}",
                self.id, s
            ))),
        }
    }

    // Registry and driver internals

    pub(crate) fn set_state(&self, next: TunnelState) -> Result<TunnelState, InvalidTransition> {
        let mut result = Err(InvalidTransition {
            from: next,
            to: next,
        });
        self.state.send_if_modified(|current| match current.transition(next) {
            Ok(_) => {
                result = Ok(*current);
                *current = next;
                true
            }
            Err(e) => {
                result = Err(e);
                false
            }
        });
        result
    }

    pub(crate) fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    pub(crate) fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub(crate) fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn touch_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub(crate) fn set_reconnect_attempts(&self, attempts: u32) {
        self.reconnect_attempts.store(attempts, Ordering::Relaxed);
    }

    pub(crate) fn current_link(&self) -> Option<Arc<dyn TunnelTransport>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_link(&self, link: Option<Arc<dyn TunnelTransport>>) {
        *self
            .link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = link;
    }

    pub(crate) fn take_link(&self) -> Option<Arc<dyn TunnelTransport>> {
        self.link
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Hand a re-dialed transport to the driver
    pub(crate) fn offer_transport(&self, transport: Arc<dyn TunnelTransport>) -> bool {
        self.resume_tx.try_send(transport).is_ok()
    }

    /// Drop everything queued and complete every waiter with `error`
    pub(crate) fn release(&self, error: ProxyError) -> usize {
        let dropped = self.queue.drain().len();
        let failed = self.pending.cancel_all(error);
        self.metrics.set_queue_depth(&self.id, 0);
        debug!(
            "Released tunnel {}: {} queued, {} waiters failed",
            self.id, dropped, failed
        );
        failed
    }

    /// Expire overdue requests, queued or in flight
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired_queued = self.queue.remove_expired(now);
        let mut expired = 0;
        for item in &expired_queued {
            if self
                .pending
                .fail(&item.correlation_id, ProxyError::RequestTimeout)
            {
                expired += 1;
            }
        }
        if !expired_queued.is_empty() {
            self.metrics.set_queue_depth(&self.id, self.queue.len());
        }
        expired + self.pending.sweep_expired(now).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use llm_relay_guard::TracingAuditSink;
    use std::time::Duration;

    fn connection(capacity: usize) -> TunnelConnection {
        let mut settings = TunnelSettings::default();
        settings.queue.capacity = capacity;
        TunnelConnection::new(
            Identity::new("alice"),
            settings,
            Arc::new(MetricsCollector::new().unwrap()),
            Arc::new(TracingAuditSink),
        )
        .0
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_submit_rejects_past_capacity() {
        let conn = connection(2);

        let _a = conn
            .submit(ProxyRequest::default(), Priority::Normal, deadline())
            .unwrap();
        let _b = conn
            .submit(ProxyRequest::default(), Priority::Normal, deadline())
            .unwrap();
        let rejected = conn.submit(ProxyRequest::default(), Priority::High, deadline());

        assert_eq!(rejected.unwrap_err(), ProxyError::QueueFull { capacity: 2 });
        assert_eq!(conn.queue_depth(), 2);
        assert_eq!(conn.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_send_fails_fast_when_not_connected() {
        let conn = connection(2);
        let result = conn.send(Envelope::ping("p", 1).unwrap()).await;
        assert!(matches!(result, Err(ProxyError::TunnelUnavailable(_))));
    }

    #[tokio::test]
    async fn test_set_state_rejects_illegal_transition() {
        let conn = connection(2);

        assert_eq!(
            conn.set_state(TunnelState::Connected),
            Ok(TunnelState::Connecting)
        );
        assert!(conn.set_state(TunnelState::Failed).is_err());
        assert_eq!(conn.state(), TunnelState::Connected);
    }

    #[tokio::test]
    async fn test_closed_tunnel_refuses_requests() {
        let conn = connection(2);
        conn.set_state(TunnelState::Closing).unwrap();
        conn.set_state(TunnelState::Closed).unwrap();

        let result = conn.submit(ProxyRequest::default(), Priority::Normal, deadline());
        assert!(matches!(result, Err(ProxyError::TunnelClosed(_))));
    }

    #[tokio::test]
    async fn test_release_fails_all_waiters() {
        let conn = connection(4);
        let handles: Vec<_> = (0..3)
            .map(|_| {
                conn.submit(ProxyRequest::default(), Priority::Low, deadline())
                    .unwrap()
            })
            .collect();

        assert_eq!(conn.release(ProxyError::TunnelClosed("bye".into())), 3);
        assert_eq!(conn.queue_depth(), 0);

        for handle in handles {
            assert!(matches!(
                handle.wait().await,
                Err(ProxyError::TunnelClosed(_))
            ));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_queued_requests() {
        let conn = connection(4);
        let short = conn
            .submit(
                ProxyRequest::default(),
                Priority::Normal,
                Instant::now() + Duration::from_secs(1),
            )
            .unwrap();
        let _long = conn
            .submit(ProxyRequest::default(), Priority::Normal, deadline())
            .unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(conn.sweep(Instant::now()), 1);
        assert_eq!(conn.queue_depth(), 1);
        assert_eq!(short.wait().await, Err(ProxyError::RequestTimeout));
    }
}
